//! Typed records for the structured (`-outfmt 5`) output of the NCBI BLAST
//! family of programs.
//!
//! The records follow `NCBI_BlastOutput.mod.dtd` one field per element. They
//! carry no XML knowledge of their own; the decoder in the `blastpipe` crate
//! fills them in a single pass and callers treat them as read-only.
//!
//! Numeric fields default to zero and text fields to the empty string when the
//! corresponding element is absent from the document.

use serde::{Deserialize, Serialize};

/// One complete run: `BlastOutput`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlastReport {
    pub program: String,
    pub version: String,
    pub reference: String,
    pub db: String,
    pub query_id: String,
    pub query_def: String,
    pub query_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_seq: Option<String>,
    pub params: SearchParameters,
    pub iterations: Vec<Iteration>,
}

impl BlastReport {
    /// Number of hits across all iterations.
    pub fn total_hits(&self) -> usize {
        self.iterations.iter().map(|iteration| iteration.hits.len()).sum()
    }

    /// Iterations that reported at least one hit, in document order.
    pub fn iterations_with_hits(&self) -> impl Iterator<Item = &Iteration> {
        self.iterations.iter().filter(|iteration| !iteration.is_empty())
    }
}

/// Scoring and search configuration echoed by the tool: `Parameters`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParameters {
    pub matrix: String,
    pub expect: f64,
    pub include: f64,
    pub sc_match: i32,
    pub sc_mismatch: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
    pub filter: String,
    pub pattern: String,
    pub entrez_query: String,
}

/// One search round: `Iteration`.
///
/// An iteration without hits is a valid result. The tool then usually sets
/// `message`, e.g. "No hits found".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub num: usize,
    pub query_id: String,
    pub query_def: String,
    pub query_len: usize,
    pub hits: Vec<Hit>,
    pub stats: Statistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Iteration {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Search space metrics of one iteration: `Statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub db_num: u64,
    pub db_len: u64,
    pub hsp_len: u64,
    pub eff_space: f64,
    pub kappa: f64,
    pub lambda: f64,
    pub entropy: f64,
}

/// One matched database entry: `Hit`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub num: usize,
    pub id: String,
    pub def: String,
    pub accession: String,
    pub len: usize,
    pub hsps: Vec<Hsp>,
}

impl Hit {
    /// The HSP with the lowest e-value; ties keep the earlier one.
    pub fn best_hsp(&self) -> Option<&Hsp> {
        self.hsps.iter().reduce(|best, hsp| {
            if hsp.evalue < best.evalue {
                hsp
            } else {
                best
            }
        })
    }
}

/// One local alignment between query and hit: `Hsp`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hsp {
    pub num: usize,
    pub bit_score: f64,
    pub score: f64,
    pub evalue: f64,
    pub query_from: usize,
    pub query_to: usize,
    pub hit_from: usize,
    pub hit_to: usize,
    pub pattern_from: usize,
    pub pattern_to: usize,
    pub query_frame: i32,
    pub hit_frame: i32,
    pub identity: usize,
    pub positive: usize,
    pub gaps: usize,
    pub align_len: usize,
    pub density: usize,
    pub qseq: String,
    pub hseq: String,
    pub midline: String,
}

impl Hsp {
    /// Query, hit and midline strings have the same number of columns.
    ///
    /// Well-formed tool output always satisfies this; the decoder does not
    /// enforce it.
    pub fn is_consistent(&self) -> bool {
        let columns = self.qseq.chars().count();
        self.hseq.chars().count() == columns && self.midline.chars().count() == columns
    }

    /// Identities as a percentage of the alignment length, 0 for an empty
    /// alignment.
    pub fn percent_identity(&self) -> f64 {
        if self.align_len == 0 {
            return 0.0;
        }
        100.0 * self.identity as f64 / self.align_len as f64
    }
}
