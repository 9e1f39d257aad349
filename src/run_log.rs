// =============================================================================
// run_log.rs - THE LOG THAT GOES BACK IN THE RESPONSE
// =============================================================================
//
// Whoever triggers a scrape (usually a cron job, sometimes a person with
// curl and a bad feeling about yesterday's numbers) wants to see what
// happened without shelling into the box. So every line a run logs is both
// a tracing event and a string in the JSON `log` array.
// =============================================================================

use parking_lot::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::SourceId;

pub struct RunLog {
    run_id: String,
    source: SourceId,
    lines: Mutex<Vec<String>>,
}

impl RunLog {
    pub fn new(source: SourceId) -> Self {
        let log = Self {
            run_id: Uuid::new_v4().to_string(),
            source,
            lines: Mutex::new(Vec::new()),
        };
        log.info(format!("Run {} started for source '{}'", log.run_id, source));
        log
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        info!(source = %self.source, run_id = %self.run_id, "{}", line);
        self.lines.lock().push(line);
    }

    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        warn!(source = %self.source, run_id = %self.run_id, "{}", line);
        self.lines.lock().push(format!("WARN: {}", line));
    }

    pub fn error(&self, line: impl Into<String>) {
        let line = line.into();
        error!(source = %self.source, run_id = %self.run_id, "{}", line);
        self.lines.lock().push(format!("ERROR: {}", line));
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}
