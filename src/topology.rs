//! Immutable view of the machine: book size, per-IG book populations, node
//! identity math, and the service directory, loaded from the machine config
//! JSON.  Only the fields the librarian core consumes are parsed; everything
//! else in the file is ignored.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::books::{BOOK_NUM_MASK, IG_MASK};

/// Nodes per enclosure in this machine generation.
pub const NODES_PER_ENCLOSURE: u32 = 10;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TopologyError {
    #[error("reading config file failed")]
    Read(#[source] std::io::Error),
    #[error("config file is not valid JSON")]
    Parse(#[source] serde_json::Error),
    #[error("illegal size multiplier \"{0}\"")]
    BadMultiplier(String),
    #[error("\"{0}\" is not an integer")]
    BadInteger(String),
    #[error("book size {0} is not usable")]
    BadBookSize(u64),
    #[error("interleave group {0} out of range")]
    BadGroupId(u64),
    #[error("interleave group {ig} holds {books} books, above the 13-bit limit")]
    TooManyBooks { ig: u8, books: u64 },
    #[error("node count {nodes} does not match {igs} interleave groups")]
    NodeIgMismatch { nodes: u32, igs: usize },
    #[error("declared NVM total {declared} conflicts with computed {computed}")]
    NvmMismatch { declared: u64, computed: u64 },
}

/// One entry of the service directory (transport endpoints etc).
#[derive(Clone, Debug, Deserialize)]
pub struct Service {
    #[serde(rename = "restUri", default)]
    pub rest_uri: String,
    #[serde(default)]
    pub port: u16,
}

/// Integer, or integer-with-suffix string, in the config file.
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Int(u64),
    Text(String),
}

impl SizeSpec {
    fn resolve(&self, section: &str, book_size: u64) -> Result<u64, TopologyError> {
        match self {
            Self::Int(n) => Ok(*n),
            Self::Text(s) => multiplier(s, section, book_size),
        }
    }
}

/// Parse an integer with an optional `K|M|G|T|B` suffix.  `B` scales by the
/// book size and is only legal once that is known.
pub fn multiplier(instr: &str, section: &str, book_size_bytes: u64) -> Result<u64, TopologyError> {
    if let Ok(n) = instr.parse::<u64>() {
        return Ok(n);
    }
    let Some(suffix) = instr.chars().last() else {
        return Err(TopologyError::BadInteger(instr.to_string()));
    };
    let base = &instr[..instr.len() - suffix.len_utf8()];
    let rsize: u64 = base
        .parse()
        .map_err(|_| TopologyError::BadInteger(base.to_string()))?;
    match suffix.to_ascii_uppercase() {
        'K' => Ok(rsize << 10),
        'M' => Ok(rsize << 20),
        'G' => Ok(rsize << 30),
        'T' => Ok(rsize << 40),
        'B' => {
            if book_size_bytes == 0 {
                return Err(TopologyError::BadMultiplier(format!(
                    "suffix \"B\" not useable in [{section}]"
                )));
            }
            Ok(rsize * book_size_bytes)
        }
        _ => Err(TopologyError::BadMultiplier(format!(
            "\"{suffix}\" in [{section}]"
        ))),
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "bookSize")]
    book_size: SizeSpec,
    /// IG id -> book count; JSON object keys arrive as strings.
    #[serde(rename = "booksPerIG")]
    books_per_ig: BTreeMap<String, SizeSpec>,
    #[serde(rename = "nodeCount", default)]
    node_count: Option<u32>,
    #[serde(rename = "nvmBytesTotal", default)]
    nvm_bytes_total: Option<SizeSpec>,
    #[serde(default)]
    services: HashMap<String, Service>,
}

/// The parsed, validated view.  Construction is the only mutation.
#[derive(Clone, Debug)]
pub struct Topology {
    book_size_bytes: u64,
    /// Index is the IG id; zero entries are real (an IG with no books).
    books_per_ig: Vec<u64>,
    /// Flat-space byte base of each IG: cumulative actual book spans.
    ig_starts: Vec<u64>,
    nvm_bytes_total: u64,
    node_count: u32,
    services: HashMap<String, Service>,
}

impl Topology {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let text = fs::read_to_string(path).map_err(TopologyError::Read)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, TopologyError> {
        let raw: RawConfig = serde_json::from_str(text).map_err(TopologyError::Parse)?;

        let book_size_bytes = raw.book_size.resolve("bookSize", 0)?;
        if book_size_bytes == 0 {
            return Err(TopologyError::BadBookSize(book_size_bytes));
        }

        let mut books_per_ig = Vec::new();
        for (key, count) in &raw.books_per_ig {
            let ig: u64 = key
                .parse()
                .map_err(|_| TopologyError::BadInteger(key.clone()))?;
            if ig > IG_MASK {
                return Err(TopologyError::BadGroupId(ig));
            }
            let books = count.resolve("booksPerIG", book_size_bytes)?;
            if books > BOOK_NUM_MASK + 1 {
                return Err(TopologyError::TooManyBooks {
                    ig: ig as u8,
                    books,
                });
            }
            if books_per_ig.len() <= ig as usize {
                books_per_ig.resize(ig as usize + 1, 0);
            }
            books_per_ig[ig as usize] = books;
        }

        // IG <-> node is pinned 1:1, so the node count falls out of the IG
        // list unless the file says otherwise (and then it has to agree).
        let node_count = match raw.node_count {
            Some(n) if n as usize != books_per_ig.len() => {
                return Err(TopologyError::NodeIgMismatch {
                    nodes: n,
                    igs: books_per_ig.len(),
                })
            }
            Some(n) => n,
            None => books_per_ig.len() as u32,
        };

        let computed: u64 = books_per_ig.iter().map(|b| b * book_size_bytes).sum();
        if let Some(declared) = &raw.nvm_bytes_total {
            let declared = declared.resolve("nvmBytesTotal", book_size_bytes)?;
            if declared != computed {
                return Err(TopologyError::NvmMismatch { declared, computed });
            }
        }

        let mut ig_starts = Vec::with_capacity(books_per_ig.len());
        let mut acc = 0u64;
        for books in &books_per_ig {
            ig_starts.push(acc);
            acc += books * book_size_bytes;
        }

        Ok(Self {
            book_size_bytes,
            books_per_ig,
            ig_starts,
            nvm_bytes_total: computed,
            node_count,
            services: raw.services,
        })
    }

    pub fn book_size_bytes(&self) -> u64 {
        self.book_size_bytes
    }

    pub fn nvm_bytes_total(&self) -> u64 {
        self.nvm_bytes_total
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn ig_count(&self) -> usize {
        self.books_per_ig.len()
    }

    pub fn books_in_ig(&self, ig: u8) -> u64 {
        self.books_per_ig.get(ig as usize).copied().unwrap_or(0)
    }

    /// Byte base of an IG in the flat space (actual spans, gaps collapsed).
    pub fn ig_start(&self, ig: u8) -> Option<u64> {
        self.ig_starts.get(ig as usize).copied()
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// IG owned by a node under the 1:1 rule.  Nodes are 1-based.
    pub fn ig_of_node(&self, node_id: u32) -> u8 {
        (u64::from(node_id.saturating_sub(1)) & IG_MASK) as u8
    }

    pub fn enclosure_of_node(&self, node_id: u32) -> u32 {
        node_id.saturating_sub(1) / NODES_PER_ENCLOSURE + 1
    }

    /// All node ids in an enclosure, clipped to the machine's population.
    pub fn nodes_in_enclosure(&self, enc: u32) -> RangeInclusive<u32> {
        let first = (enc - 1) * NODES_PER_ENCLOSURE + 1;
        let last = (first + NODES_PER_ENCLOSURE - 1).min(self.node_count);
        first..=last
    }

    pub fn hostname(&self, node_id: u32) -> String {
        format!("node{node_id:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(text: &str) -> Topology {
        Topology::from_json(text).unwrap()
    }

    #[test]
    fn multiplier_suffixes() {
        assert_eq!(multiplier("8", "t", 0).unwrap(), 8);
        assert_eq!(multiplier("8K", "t", 0).unwrap(), 8 << 10);
        assert_eq!(multiplier("8M", "t", 0).unwrap(), 8 << 20);
        assert_eq!(multiplier("8G", "t", 0).unwrap(), 8 << 30);
        assert_eq!(multiplier("2T", "t", 0).unwrap(), 2 << 40);
        assert_eq!(multiplier("3B", "t", 1 << 20).unwrap(), 3 << 20);
        assert!(multiplier("3B", "t", 0).is_err());
        assert!(multiplier("8Q", "t", 0).is_err());
        assert!(multiplier("fnord", "t", 0).is_err());
    }

    #[test]
    fn parses_and_derives() {
        let t = cfg(
            r#"{
                "bookSize": "8G",
                "booksPerIG": { "0": 3, "1": 2 },
                "services": { "librarian": { "restUri": "http://node01:9093" } }
            }"#,
        );
        assert_eq!(t.book_size_bytes(), 8 << 30);
        assert_eq!(t.node_count(), 2);
        assert_eq!(t.books_in_ig(0), 3);
        assert_eq!(t.books_in_ig(1), 2);
        assert_eq!(t.nvm_bytes_total(), 5 * (8u64 << 30));
        assert_eq!(t.ig_start(0), Some(0));
        assert_eq!(t.ig_start(1), Some(3 * (8u64 << 30)));
        assert_eq!(t.ig_start(2), None);
        assert!(t.service("librarian").is_some());
    }

    #[test]
    fn nvm_total_must_agree() {
        let err = Topology::from_json(
            r#"{
                "bookSize": 1048576,
                "booksPerIG": { "0": 4 },
                "nvmBytesTotal": "5M"
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::NvmMismatch { .. }));
    }

    #[test]
    fn node_identity_math() {
        let igs: String = (0..25).map(|i| format!("\"{i}\": 1,")).collect();
        let igs = igs.trim_end_matches(',');
        let t = cfg(&format!(
            r#"{{ "bookSize": "1M", "booksPerIG": {{ {igs} }} }}"#
        ));
        assert_eq!(t.node_count(), 25);
        assert_eq!(t.ig_of_node(1), 0);
        assert_eq!(t.ig_of_node(25), 24);
        assert_eq!(t.enclosure_of_node(1), 1);
        assert_eq!(t.enclosure_of_node(10), 1);
        assert_eq!(t.enclosure_of_node(11), 2);
        assert_eq!(t.nodes_in_enclosure(1), 1..=10);
        // last enclosure is clipped to the real population
        assert_eq!(t.nodes_in_enclosure(3), 21..=25);
        assert_eq!(t.hostname(7), "node07");
    }

    #[test]
    fn rejects_oversized_ig() {
        let err = Topology::from_json(
            r#"{ "bookSize": "1M", "booksPerIG": { "0": 9000 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::TooManyBooks { .. }));
    }
}
