//! Whole-card consistency check.

use std::collections::HashMap;
use std::fmt;

use log::debug;

use crate::device::BlockAdapter;
use crate::fat::FatLink;
use crate::session::Session;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// A chain could not be followed or read.
    BrokenChain { path: String, reason: String },
    CrossLinked { cluster: u32, first: String, second: String },
    SizeMismatch { path: String, size: u32, clusters: usize },
    /// Allocated in the FAT but reachable from no entry.
    LostCluster { cluster: u32 },
    BadTimestamp { path: String },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Problem::BrokenChain { path, reason } => write!(f, "{path}: {reason}"),
            Problem::CrossLinked {
                cluster,
                first,
                second,
            } => write!(f, "cluster {cluster} is shared by {first} and {second}"),
            Problem::SizeMismatch {
                path,
                size,
                clusters,
            } => write!(f, "{path}: {size} bytes stored in {clusters} cluster(s)"),
            Problem::LostCluster { cluster } => write!(f, "cluster {cluster} is lost"),
            Problem::BadTimestamp { path } => write!(f, "{path}: invalid modification time"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub files: u32,
    pub directories: u32,
    pub used_clusters: u32,
    pub problems: Vec<Problem>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

struct Walk {
    report: CheckReport,
    owners: HashMap<u32, String>,
}

impl Walk {
    /// Records a failure that belongs in the report rather than aborting.
    fn note(&mut self, path: &str, err: Error) -> Result<()> {
        match err {
            Error::CorruptChain { .. } | Error::Media { .. } => {
                self.report.problems.push(Problem::BrokenChain {
                    path: path.to_string(),
                    reason: err.to_string(),
                });
                Ok(())
            }
            err => Err(err),
        }
    }

    /// Marks a chain's clusters as owned by `path`; false when any of them
    /// already had an owner.
    fn claim(&mut self, path: &str, chain: &[u32]) -> bool {
        let mut exclusive = true;
        for &cluster in chain {
            if let Some(first) = self.owners.insert(cluster, path.to_string()) {
                self.report.problems.push(Problem::CrossLinked {
                    cluster,
                    first,
                    second: path.to_string(),
                });
                exclusive = false;
            }
        }
        exclusive
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

impl<D: BlockAdapter> Session<D> {
    /// Walks every directory from the root and cross-checks the FAT.
    pub fn check(&mut self) -> Result<CheckReport> {
        let cluster_size = self.io.cluster_size();
        let mut walk = Walk {
            report: CheckReport::default(),
            owners: HashMap::new(),
        };
        let mut pending = vec![("/".to_string(), self.superblock.rootdir_cluster)];

        while let Some((path, cluster)) = pending.pop() {
            walk.report.directories += 1;
            let dir = match self.load_dir(cluster) {
                Ok(dir) => dir,
                Err(err) => {
                    walk.note(&path, err)?;
                    continue;
                }
            };
            if !walk.claim(&path, &dir.chain) {
                continue;
            }

            for entry in dir.entries.iter().filter(|entry| entry.is_visible()) {
                let path = child_path(&path, &entry.display_name());
                if entry.modified.to_datetime().is_err() {
                    walk.report.problems.push(Problem::BadTimestamp { path: path.clone() });
                }
                if entry.is_dir() {
                    pending.push((path, entry.cluster));
                    continue;
                }

                walk.report.files += 1;
                let chain = match entry.start_cluster() {
                    Some(start) => match self.fat.chain(&mut self.io, start) {
                        Ok(chain) => chain,
                        Err(err) => {
                            walk.note(&path, err)?;
                            continue;
                        }
                    },
                    None => Vec::new(),
                };
                walk.claim(&path, &chain);
                let needed = (entry.size as usize).div_ceil(cluster_size);
                if chain.len() < needed || chain.len() > needed.max(1) {
                    walk.report.problems.push(Problem::SizeMismatch {
                        path,
                        size: entry.size,
                        clusters: chain.len(),
                    });
                }
            }
        }

        for index in 0..self.fat.alloc_end() {
            let allocated = matches!(
                FatLink::decode(self.fat.raw_entry(&mut self.io, index)?),
                FatLink::Next(_) | FatLink::EndOfChain
            );
            if allocated && !walk.owners.contains_key(&index) {
                walk.report.problems.push(Problem::LostCluster { cluster: index });
            }
        }

        walk.report.used_clusters = walk.owners.len() as u32;
        debug!(
            "checked {} file(s) in {} directories: {} problem(s)",
            walk.report.files,
            walk.report.directories,
            walk.report.problems.len()
        );
        Ok(walk.report)
    }
}
