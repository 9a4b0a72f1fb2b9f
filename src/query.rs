//! Building invocations of BLAST programs.
//!
//! A [`Blaster`] describes one search: the executable to run, its command
//! line switches and, optionally, the query sequences fed to its standard
//! input. [`BlastQuery`] covers the common cases; callers needing exotic
//! setups can implement [`Blaster`] themselves.

use crate::error::BlastError;
use crate::flags::{FlagValue, Flags};
use crate::tools::{
    BLASTN_ENV_BIN, BLASTP_ENV_BIN, DEFAULT_BLASTN_BIN, DEFAULT_BLASTP_BIN,
    resolve_tool_executable,
};
use bio::io::fasta;
use std::io::{Cursor, Read, Write};

/// Residues per line in rendered FASTA.
pub const FASTA_LINE_WIDTH: usize = 60;

pub trait Blaster {
    /// Executable to launch, resolved through the OS executable search.
    fn executable(&self) -> &str;

    /// Command line arguments. Must not contain `-outfmt`, which the runner
    /// owns.
    fn cmd_args(&self) -> Vec<String>;

    /// Standard input for the process, `None` when the query is supplied some
    /// other way (e.g. a `-query` file flag).
    fn stdin(&self) -> Option<Box<dyn Read + Send>>;
}

#[derive(Debug, Clone)]
pub struct BlastQuery {
    executable: String,
    queries: Vec<fasta::Record>,
    flags: Flags,
    default_threads: usize,
}

impl BlastQuery {
    /// A search with no preset flags.
    pub fn new(executable: &str, queries: Vec<fasta::Record>) -> Self {
        Self {
            executable: executable.to_string(),
            queries,
            flags: Flags::new(),
            default_threads: available_threads(),
        }
    }

    /// Protein search against `database`, using every logical CPU.
    pub fn blastp(queries: Vec<fasta::Record>, database: &str) -> Self {
        let executable = resolve_tool_executable(BLASTP_ENV_BIN, DEFAULT_BLASTP_BIN);
        Self::with_database(&executable, queries, database)
    }

    /// Nucleotide search against `database`, using every logical CPU.
    pub fn blastn(queries: Vec<fasta::Record>, database: &str) -> Self {
        let executable = resolve_tool_executable(BLASTN_ENV_BIN, DEFAULT_BLASTN_BIN);
        Self::with_database(&executable, queries, database)
    }

    fn with_database(executable: &str, queries: Vec<fasta::Record>, database: &str) -> Self {
        let mut query = Self::new(executable, queries);
        query.set_flag("db", database);
        query.set_flag("num_threads", query.default_threads);
        query
    }

    pub fn with_executable(mut self, executable: &str) -> Self {
        self.executable = executable.to_string();
        self
    }

    /// Sets a switch by name, without the leading dash. `false` removes it.
    pub fn set_flag(&mut self, name: &str, value: impl Into<FlagValue>) {
        self.flags.set(name, value);
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn queries(&self) -> &[fasta::Record] {
        &self.queries
    }

    /// Parallelism detected when this query was built.
    pub fn default_threads(&self) -> usize {
        self.default_threads
    }
}

impl Blaster for BlastQuery {
    fn executable(&self) -> &str {
        &self.executable
    }

    fn cmd_args(&self) -> Vec<String> {
        self.flags.cmd_args()
    }

    fn stdin(&self) -> Option<Box<dyn Read + Send>> {
        let bytes = render_queries(&self.queries)?;
        Some(Box::new(Cursor::new(bytes)))
    }
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// FASTA text for `queries`, or `None` for an empty collection.
pub fn render_queries(queries: &[fasta::Record]) -> Option<Vec<u8>> {
    if queries.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    for record in queries {
        write_record(&mut out, record);
    }
    Some(out)
}

fn write_record(out: &mut Vec<u8>, record: &fasta::Record) {
    // Writing into a Vec cannot fail.
    let _ = match record.desc() {
        Some(desc) => writeln!(out, ">{} {}", record.id(), desc),
        None => writeln!(out, ">{}", record.id()),
    };
    for line in record.seq().chunks(FASTA_LINE_WIDTH) {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
}

/// Reads query records from a FASTA file.
pub fn read_query_fasta(path: &str) -> Result<Vec<fasta::Record>, BlastError> {
    let reader = fasta::Reader::from_file(path).map_err(|e| BlastError::Io {
        message: format!("Could not read FASTA file '{path}': {e}"),
    })?;
    reader
        .records()
        .map(|record| {
            record.map_err(|e| BlastError::Io {
                message: format!("Malformed FASTA record in '{path}': {e}"),
            })
        })
        .collect()
}
