use std::{fmt, result};

use crate::art::reclaim;

/// Statistic type, for [Index][crate::art::Index].
///
/// Node and identifier counts are filled only by
/// [validate][crate::art::Index::validate], which walks the tree.
#[derive(Default)]
pub struct Stats {
    pub name: String,
    pub n_node4: usize,
    pub n_node16: usize,
    pub n_node48: usize,
    pub n_node256: usize,
    pub n_inlined: usize,
    pub n_external: usize,
    pub n_tids: usize,
    pub reclaim: reclaim::Stats,
}

impl Stats {
    pub(crate) fn new(name: &str) -> Stats {
        Stats {
            name: name.to_string(),
            ..Stats::default()
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        writeln!(f, "art.name = {}", self.name)?;
        writeln!(
            f,
            "art = {{ n_node4={}, n_node16={}, n_node48={}, n_node256={} }}",
            self.n_node4, self.n_node16, self.n_node48, self.n_node256,
        )?;
        writeln!(
            f,
            "art = {{ n_inlined={}, n_external={}, n_tids={} }}",
            self.n_inlined, self.n_external, self.n_tids,
        )?;
        writeln!(f, "art.reclaim = {}", self.reclaim)
    }
}
