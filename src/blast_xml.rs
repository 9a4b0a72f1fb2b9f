//! Incremental decoder for NCBI BLAST XML (`-outfmt 5`, `BlastOutput`).
//!
//! The document is read as a stream of quick-xml events from any `BufRead`,
//! so output can be decoded straight off a pipe while the producing process
//! is still running. Elements map one-to-one onto the protocol records;
//! unknown elements are skipped. An absent element leaves the field at its
//! default, while a numeric element with non-numeric content is an error.
//!
//! Text is taken verbatim (no trimming) because alignment midlines may start
//! or end with a space.

use crate::error::BlastError;
use blastpipe_protocol::{BlastReport, Hit, Hsp, Iteration, SearchParameters, Statistics};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use std::{fmt, fs::File, io::BufRead, io::BufReader, str::FromStr};

const ROOT_ELEMENT: &str = "BlastOutput";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDecodeError {
    pub message: String,
    /// Byte offset in the input where decoding stopped.
    pub position: u64,
}

impl fmt::Display for XmlDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.message, self.position)
    }
}

impl std::error::Error for XmlDecodeError {}

/// Decodes one `BlastOutput` document from `input`.
///
/// Reading stops at the closing root tag; anything after it is left unread.
pub fn decode_blast_xml<R: BufRead>(input: R) -> Result<BlastReport, XmlDecodeError> {
    BlastXmlDecoder::new(input).read_document()
}

pub fn parse_blast_xml_text(xml: &str) -> Result<BlastReport, XmlDecodeError> {
    decode_blast_xml(xml.as_bytes())
}

pub fn parse_blast_xml_file(path: &str) -> Result<BlastReport, BlastError> {
    let file = File::open(path).map_err(|e| BlastError::Io {
        message: format!("Could not read XML file '{path}': {e}"),
    })?;
    decode_blast_xml(BufReader::new(file)).map_err(|e| BlastError::XmlFile {
        path: path.to_string(),
        message: e.to_string(),
    })
}

type DecodeResult<T> = Result<T, XmlDecodeError>;

#[derive(Debug)]
struct Element {
    name: String,
    empty: bool,
}

impl Element {
    fn new(start: &BytesStart, empty: bool) -> Self {
        Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            empty,
        }
    }
}

struct BlastXmlDecoder<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> BlastXmlDecoder<R> {
    fn new(input: R) -> Self {
        Self {
            reader: Reader::from_reader(input),
            buf: Vec::new(),
        }
    }

    fn error(&self, message: impl Into<String>) -> XmlDecodeError {
        XmlDecodeError {
            message: message.into(),
            position: self.reader.buffer_position() as u64,
        }
    }

    fn next_event(&mut self) -> DecodeResult<Event<'static>> {
        self.buf.clear();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(event) => Ok(event.into_owned()),
            Err(e) => Err(XmlDecodeError {
                message: format!("malformed XML: {e}"),
                position: self.reader.buffer_position() as u64,
            }),
        }
    }

    /// Next child element of `parent`, `None` once `parent` is closed.
    fn next_child(&mut self, parent: &Element) -> DecodeResult<Option<Element>> {
        if parent.empty {
            return Ok(None);
        }
        loop {
            match self.next_event()? {
                Event::Start(start) => return Ok(Some(Element::new(&start, false))),
                Event::Empty(start) => return Ok(Some(Element::new(&start, true))),
                Event::End(_) => return Ok(None),
                Event::Eof => {
                    return Err(self.error(format!(
                        "unexpected end of document inside <{}>",
                        parent.name
                    )));
                }
                _ => continue,
            }
        }
    }

    fn skip(&mut self, element: &Element) -> DecodeResult<()> {
        if element.empty {
            return Ok(());
        }
        self.buf.clear();
        self.reader
            .read_to_end_into(QName(element.name.as_bytes()), &mut self.buf)
            .map_err(|e| {
                self.error(format!("malformed XML inside <{}>: {e}", element.name))
            })?;
        Ok(())
    }

    fn read_text(&mut self, element: &Element) -> DecodeResult<String> {
        let mut text = String::new();
        if element.empty {
            return Ok(text);
        }
        loop {
            match self.next_event()? {
                Event::Text(raw) => {
                    let unescaped = raw.unescape().map_err(|e| {
                        self.error(format!("invalid text in <{}>: {e}", element.name))
                    })?;
                    text.push_str(&unescaped);
                }
                Event::CData(raw) => {
                    let bytes = raw.into_inner();
                    let chunk = std::str::from_utf8(&bytes).map_err(|e| {
                        self.error(format!("invalid UTF-8 in <{}>: {e}", element.name))
                    })?;
                    text.push_str(chunk);
                }
                Event::End(_) => return Ok(text),
                Event::Start(nested) | Event::Empty(nested) => {
                    return Err(self.error(format!(
                        "unexpected element <{}> inside <{}>",
                        String::from_utf8_lossy(nested.name().as_ref()),
                        element.name
                    )));
                }
                Event::Eof => {
                    return Err(self.error(format!(
                        "unexpected end of document inside <{}>",
                        element.name
                    )));
                }
                _ => continue,
            }
        }
    }

    fn read_number<T>(&mut self, element: &Element) -> DecodeResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.read_text(element)?;
        let trimmed = raw.trim();
        trimmed.parse::<T>().map_err(|e| {
            self.error(format!(
                "<{}> expects a number, found '{}': {}",
                element.name, trimmed, e
            ))
        })
    }

    /// Decodes every `item` child of `wrapper` into `out`, in document order.
    fn read_list<T>(
        &mut self,
        wrapper: &Element,
        item: &str,
        read: fn(&mut Self, &Element) -> DecodeResult<T>,
        out: &mut Vec<T>,
    ) -> DecodeResult<()> {
        while let Some(child) = self.next_child(wrapper)? {
            if child.name == item {
                out.push(read(self, &child)?);
            } else {
                self.skip(&child)?;
            }
        }
        Ok(())
    }

    /// Decodes the first `item` child of `wrapper`.
    fn read_single<T>(
        &mut self,
        wrapper: &Element,
        item: &str,
        read: fn(&mut Self, &Element) -> DecodeResult<T>,
    ) -> DecodeResult<Option<T>> {
        let mut found = None;
        while let Some(child) = self.next_child(wrapper)? {
            if child.name == item && found.is_none() {
                found = Some(read(self, &child)?);
            } else {
                self.skip(&child)?;
            }
        }
        Ok(found)
    }

    fn read_document(&mut self) -> DecodeResult<BlastReport> {
        loop {
            let root = match self.next_event()? {
                Event::Start(start) => Element::new(&start, false),
                Event::Empty(start) => Element::new(&start, true),
                Event::Eof => {
                    return Err(self.error(format!("no <{ROOT_ELEMENT}> element in document")));
                }
                _ => continue,
            };
            if root.name != ROOT_ELEMENT {
                return Err(self.error(format!(
                    "expected <{ROOT_ELEMENT}> root element, found <{}>",
                    root.name
                )));
            }
            return self.read_blast_output(&root);
        }
    }

    fn read_blast_output(&mut self, element: &Element) -> DecodeResult<BlastReport> {
        let mut report = BlastReport::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "BlastOutput_program" => report.program = self.read_text(&child)?,
                "BlastOutput_version" => report.version = self.read_text(&child)?,
                "BlastOutput_reference" => report.reference = self.read_text(&child)?,
                "BlastOutput_db" => report.db = self.read_text(&child)?,
                "BlastOutput_query-ID" => report.query_id = self.read_text(&child)?,
                "BlastOutput_query-def" => report.query_def = self.read_text(&child)?,
                "BlastOutput_query-len" => report.query_len = self.read_number(&child)?,
                "BlastOutput_query-seq" => report.query_seq = Some(self.read_text(&child)?),
                "BlastOutput_param" => {
                    if let Some(params) =
                        self.read_single(&child, "Parameters", Self::read_parameters)?
                    {
                        report.params = params;
                    }
                }
                "BlastOutput_iterations" => self.read_list(
                    &child,
                    "Iteration",
                    Self::read_iteration,
                    &mut report.iterations,
                )?,
                _ => self.skip(&child)?,
            }
        }
        Ok(report)
    }

    fn read_parameters(&mut self, element: &Element) -> DecodeResult<SearchParameters> {
        let mut params = SearchParameters::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "Parameters_matrix" => params.matrix = self.read_text(&child)?,
                "Parameters_expect" => params.expect = self.read_number(&child)?,
                "Parameters_include" => params.include = self.read_number(&child)?,
                "Parameters_sc-match" => params.sc_match = self.read_number(&child)?,
                "Parameters_sc-mismatch" => params.sc_mismatch = self.read_number(&child)?,
                "Parameters_gap-open" => params.gap_open = self.read_number(&child)?,
                "Parameters_gap-extend" => params.gap_extend = self.read_number(&child)?,
                "Parameters_filter" => params.filter = self.read_text(&child)?,
                "Parameters_pattern" => params.pattern = self.read_text(&child)?,
                "Parameters_entrez-query" => params.entrez_query = self.read_text(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(params)
    }

    fn read_iteration(&mut self, element: &Element) -> DecodeResult<Iteration> {
        let mut iteration = Iteration::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "Iteration_iter-num" => iteration.num = self.read_number(&child)?,
                "Iteration_query-ID" => iteration.query_id = self.read_text(&child)?,
                "Iteration_query-def" => iteration.query_def = self.read_text(&child)?,
                "Iteration_query-len" => iteration.query_len = self.read_number(&child)?,
                "Iteration_hits" => {
                    self.read_list(&child, "Hit", Self::read_hit, &mut iteration.hits)?
                }
                "Iteration_stat" => {
                    if let Some(stats) =
                        self.read_single(&child, "Statistics", Self::read_statistics)?
                    {
                        iteration.stats = stats;
                    }
                }
                "Iteration_message" => {
                    iteration.message = nonempty_owned(&self.read_text(&child)?)
                }
                _ => self.skip(&child)?,
            }
        }
        Ok(iteration)
    }

    fn read_statistics(&mut self, element: &Element) -> DecodeResult<Statistics> {
        let mut stats = Statistics::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "Statistics_db-num" => stats.db_num = self.read_number(&child)?,
                "Statistics_db-len" => stats.db_len = self.read_number(&child)?,
                "Statistics_hsp-len" => stats.hsp_len = self.read_number(&child)?,
                "Statistics_eff-space" => stats.eff_space = self.read_number(&child)?,
                "Statistics_kappa" => stats.kappa = self.read_number(&child)?,
                "Statistics_lambda" => stats.lambda = self.read_number(&child)?,
                "Statistics_entropy" => stats.entropy = self.read_number(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(stats)
    }

    fn read_hit(&mut self, element: &Element) -> DecodeResult<Hit> {
        let mut hit = Hit::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "Hit_num" => hit.num = self.read_number(&child)?,
                "Hit_id" => hit.id = self.read_text(&child)?,
                "Hit_def" => hit.def = self.read_text(&child)?,
                "Hit_accession" => hit.accession = self.read_text(&child)?,
                "Hit_len" => hit.len = self.read_number(&child)?,
                "Hit_hsps" => self.read_list(&child, "Hsp", Self::read_hsp, &mut hit.hsps)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(hit)
    }

    fn read_hsp(&mut self, element: &Element) -> DecodeResult<Hsp> {
        let mut hsp = Hsp::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "Hsp_num" => hsp.num = self.read_number(&child)?,
                "Hsp_bit-score" => hsp.bit_score = self.read_number(&child)?,
                "Hsp_score" => hsp.score = self.read_number(&child)?,
                "Hsp_evalue" => hsp.evalue = self.read_number(&child)?,
                "Hsp_query-from" => hsp.query_from = self.read_number(&child)?,
                "Hsp_query-to" => hsp.query_to = self.read_number(&child)?,
                "Hsp_hit-from" => hsp.hit_from = self.read_number(&child)?,
                "Hsp_hit-to" => hsp.hit_to = self.read_number(&child)?,
                "Hsp_pattern-from" => hsp.pattern_from = self.read_number(&child)?,
                "Hsp_pattern-to" => hsp.pattern_to = self.read_number(&child)?,
                "Hsp_query-frame" => hsp.query_frame = self.read_number(&child)?,
                "Hsp_hit-frame" => hsp.hit_frame = self.read_number(&child)?,
                "Hsp_identity" => hsp.identity = self.read_number(&child)?,
                "Hsp_positive" => hsp.positive = self.read_number(&child)?,
                "Hsp_gaps" => hsp.gaps = self.read_number(&child)?,
                "Hsp_align-len" => hsp.align_len = self.read_number(&child)?,
                "Hsp_density" => hsp.density = self.read_number(&child)?,
                "Hsp_qseq" => hsp.qseq = self.read_text(&child)?,
                "Hsp_hseq" => hsp.hseq = self.read_text(&child)?,
                "Hsp_midline" => hsp.midline = self.read_text(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(hsp)
    }
}

fn nonempty_owned(raw: &str) -> Option<String> {
    let text = raw.trim();
    (!text.is_empty()).then_some(text.to_string())
}
