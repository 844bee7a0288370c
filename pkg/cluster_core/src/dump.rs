//! `SIGUSR1` admin dump (SPEC_FULL.md §3.1's `DumpSnapshot`, §9's
//! flag-then-snapshot rule). Grounded on `examples/original_source/gulm`'s
//! `fdump_nodes`-style "walk the registry, print one line per node" admin
//! dump, written to a temp file rather than directly in the signal handler.

use std::io::Write;

use crate::registry::NodeRegistry;

/// A point-in-time copy of the registry taken on the event loop's own
/// task, never from inside the signal handler itself.
pub struct DumpSnapshot {
    lines: Vec<String>,
}

impl DumpSnapshot {
    pub fn capture(registry: &NodeRegistry) -> Self {
        let mut lines = Vec::new();
        for node in registry.iter_by_name() {
            lines.push(format!(
                "{} state={:?} missed_beats={} last_beat_micros={}",
                node.name, node.state, node.missed_beats, node.last_beat_micros
            ));
        }
        Self { lines }
    }

    /// Writes the snapshot to `$TMPDIR/Gulm_core_<pid>` (falling back to
    /// `/tmp` when `TMPDIR` is unset), truncating any prior dump from this
    /// same process.
    pub fn write_to_tmp(&self, pid: u32) -> std::io::Result<()> {
        let dir = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        let path = std::path::Path::new(&dir).join(format!("Gulm_core_{}", pid));
        let mut file = std::fs::File::create(path)?;
        for line in &self.lines {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AllowAll;

    #[test]
    fn capture_includes_one_line_per_node() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", [0u8; 16], 0, &AllowAll).unwrap();
        reg.mark_login("b", [0u8; 16], 0, &AllowAll).unwrap();
        let snapshot = DumpSnapshot::capture(&reg);
        assert_eq!(snapshot.lines.len(), 2);
        assert!(snapshot.lines[0].starts_with("a "));
    }
}
