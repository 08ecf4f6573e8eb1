use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Location of the transaction log replayed by the replicator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Path of a JSON-lines file holding one transaction fragment per line.
    pub path: PathBuf,
    /// First seqno to replay; earlier entries are skipped.
    #[serde(default)]
    pub start_seqno: u64,
}
