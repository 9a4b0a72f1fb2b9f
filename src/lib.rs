//! Run local NCBI BLAST+ searches and decode their XML output into typed
//! records while the search is still running.

pub mod blast_xml;
pub mod error;
pub mod flags;
pub mod query;
pub mod runner;
pub mod tools;

pub use blast_xml::{XmlDecodeError, decode_blast_xml, parse_blast_xml_file, parse_blast_xml_text};
pub use blastpipe_protocol::{BlastReport, Hit, Hsp, Iteration, SearchParameters, Statistics};
pub use error::BlastError;
pub use flags::{FlagValue, Flags};
pub use query::{BlastQuery, Blaster, read_query_fasta, render_queries};
pub use runner::{CancelHandle, SearchReport, run_blast, run_blast_with_cancel};
