//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it can't
//! trace usage across test binaries. These utilities are used by multiple tests.

#![allow(dead_code)]

use std::sync::Once;

use roobatch::batch::{BatchResult, Handler, Record};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a fmt subscriber honouring RUST_LOG, once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Handler that renders every record it sees as a short string
#[derive(Debug, Default)]
pub struct RecordLog {
    pub records: Vec<String>,
}

impl Handler for RecordLog {
    fn handle(&mut self, record: Record<'_>) -> BatchResult<()> {
        let line = match record {
            Record::Put { cf, key, value } => format!("Put({}, {}, {})", cf, show(key), show(value)),
            Record::Delete { cf, key } => format!("Delete({}, {})", cf, show(key)),
            Record::SingleDelete { cf, key } => format!("SingleDelete({}, {})", cf, show(key)),
            Record::DeleteRange {
                cf,
                begin_key,
                end_key,
            } => format!("DeleteRange({}, {}, {})", cf, show(begin_key), show(end_key)),
            Record::Merge { cf, key, value } => {
                format!("Merge({}, {}, {})", cf, show(key), show(value))
            }
            Record::LogData { blob } => format!("LogData({})", show(blob)),
            Record::Noop => "Noop".to_string(),
            Record::BeginPrepare => "BeginPrepare".to_string(),
            Record::EndPrepare { xid } => format!("EndPrepare({})", show(xid)),
            Record::Commit { xid } => format!("Commit({})", show(xid)),
            Record::Rollback { xid } => format!("Rollback({})", show(xid)),
        };
        self.records.push(line);
        Ok(())
    }
}

fn show(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
