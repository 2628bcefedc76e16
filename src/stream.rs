use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use serde_json::error::Category;

use crate::config::{DateSource, StreamConfig};
use crate::dates::parse_date;
use crate::dedup::SeenIds;
use crate::error::{MalformedRecord, PipelineError, Result};
use crate::models::{Event, Severity};

const READ_BUFFER_BYTES: usize = 1 << 16;
const METADATA_KEY: &str = "meta";

#[derive(Debug, Deserialize)]
struct RawReport {
    report_number: Option<String>,
    date_started: Option<String>,
    date_created: Option<String>,
    reactions: Option<Vec<String>>,
    outcomes: Option<Vec<String>>,
    products: Option<Vec<RawProduct>>,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    name_brand: Option<String>,
    industry_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub raw_items: u64,
    pub parsed: u64,
    pub skipped_malformed: u64,
    pub skipped_duplicate: u64,
    pub skipped_no_reactions: u64,
    pub dedup_probabilistic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Items { first: bool },
    Done,
}

/// Lazily yields normalized [`Event`]s from a report document.
///
/// The document is either a top-level array of reports or an object holding
/// that array under `results_key`. Only one raw report is buffered at a time.
/// Malformed reports, duplicates and reports without reactions are skipped
/// and counted; a structural error in the document ends the stream.
pub struct RecordStream<R> {
    reader: R,
    config: StreamConfig,
    state: State,
    wrapped: bool,
    buffer: Vec<u8>,
    offset: u64,
    seen: SeenIds,
    stats: StreamStats,
    metadata: Option<serde_json::Value>,
    finished: bool,
}

impl RecordStream<BufReader<File>> {
    pub fn open(path: &Path, config: StreamConfig) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(
            BufReader::with_capacity(READ_BUFFER_BYTES, file),
            config,
        ))
    }
}

impl<R: BufRead> RecordStream<R> {
    pub fn new(reader: R, config: StreamConfig) -> Self {
        let seen = SeenIds::with_capacity(config.dedup_capacity);
        Self {
            reader,
            config,
            state: State::Start,
            wrapped: false,
            buffer: Vec::new(),
            offset: 0,
            seen,
            stats: StreamStats::default(),
            metadata: None,
            finished: false,
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            dedup_probabilistic: self.seen.is_probabilistic(),
            ..self.stats
        }
    }

    /// The document's `meta` object, once the scanner has passed it.
    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        Ok(self.reader.fill_buf()?.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
        self.offset += 1;
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.bump();
        }
        Ok(byte)
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(byte) = self.peek()? {
            if !byte.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
        Ok(())
    }

    fn syntax_error(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::Json {
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn unexpected(&self, found: Option<u8>, wanted: &str) -> PipelineError {
        match found {
            Some(byte) => self.syntax_error(format!(
                "expected {wanted}, found '{}'",
                char::from(byte).escape_default()
            )),
            None => self.syntax_error(format!("expected {wanted}, found end of input")),
        }
    }

    fn expect(&mut self, wanted: u8) -> Result<()> {
        match self.next_byte()? {
            Some(byte) if byte == wanted => Ok(()),
            other => Err(self.unexpected(other, &format!("'{}'", char::from(wanted)))),
        }
    }

    /// Copies exactly one JSON value into `self.buffer`.
    fn capture_value(&mut self) -> Result<()> {
        self.buffer.clear();
        match self.peek()? {
            Some(b'{') | Some(b'[') => self.capture_container(),
            Some(b'"') => {
                self.bump();
                self.buffer.push(b'"');
                self.capture_string_tail()
            }
            Some(_) => {
                while let Some(byte) = self.peek()? {
                    if matches!(byte, b',' | b']' | b'}') || byte.is_ascii_whitespace() {
                        break;
                    }
                    self.buffer.push(byte);
                    self.bump();
                }
                Ok(())
            }
            None => Err(self.unexpected(None, "a value")),
        }
    }

    fn capture_string_tail(&mut self) -> Result<()> {
        let mut escaped = false;
        loop {
            let byte = self
                .next_byte()?
                .ok_or_else(|| self.unexpected(None, "closing '\"'"))?;
            self.buffer.push(byte);
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => return Ok(()),
                _ => {}
            }
        }
    }

    fn capture_container(&mut self) -> Result<()> {
        let mut depth = 0usize;
        loop {
            let byte = self
                .next_byte()?
                .ok_or_else(|| self.unexpected(None, "end of object or array"))?;
            self.buffer.push(byte);
            match byte {
                b'"' => self.capture_string_tail()?,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    /// Walks the wrapper object until the results array opens. Returns
    /// `false` when the object closes without one.
    fn seek_results(&mut self, mut after_value: bool) -> Result<bool> {
        loop {
            self.skip_whitespace()?;
            if after_value {
                match self.next_byte()? {
                    Some(b',') => self.skip_whitespace()?,
                    Some(b'}') => return Ok(false),
                    other => return Err(self.unexpected(other, "',' or '}'")),
                }
            } else if self.peek()? == Some(b'}') {
                self.bump();
                return Ok(false);
            }
            after_value = true;

            if self.peek()? != Some(b'"') {
                let found = self.peek()?;
                return Err(self.unexpected(found, "an object key"));
            }
            self.capture_value()?;
            let key: String = serde_json::from_slice(&self.buffer)
                .map_err(|err| self.syntax_error(format!("invalid object key: {err}")))?;
            self.skip_whitespace()?;
            self.expect(b':')?;
            self.skip_whitespace()?;

            if key == self.config.results_key {
                self.expect(b'[')?;
                return Ok(true);
            }

            self.capture_value()?;
            if key == METADATA_KEY {
                self.metadata = serde_json::from_slice(&self.buffer).ok();
            }
            self.buffer.clear();
        }
    }

    fn open_document(&mut self) -> Result<bool> {
        self.skip_whitespace()?;
        match self.next_byte()? {
            Some(b'[') => Ok(true),
            Some(b'{') => {
                self.wrapped = true;
                let found = self.seek_results(false)?;
                if !found {
                    tracing::warn!(
                        key = %self.config.results_key,
                        "document has no results array; treating it as empty"
                    );
                }
                Ok(found)
            }
            other => Err(self.unexpected(other, "'[' or '{'")),
        }
    }

    fn finish_document(&mut self) -> Result<()> {
        self.skip_whitespace()?;
        match self.peek()? {
            None => Ok(()),
            found => Err(self.unexpected(found, "end of input")),
        }
    }

    /// Buffers the next raw report. `Ok(false)` once the array is exhausted.
    fn next_raw(&mut self) -> Result<bool> {
        loop {
            match self.state {
                State::Done => return Ok(false),
                State::Start => {
                    self.state = if self.open_document()? {
                        State::Items { first: true }
                    } else {
                        self.finish_document()?;
                        State::Done
                    };
                }
                State::Items { first } => {
                    if let Some(limit) = self.config.max_records {
                        if self.stats.raw_items >= limit {
                            self.state = State::Done;
                            return Ok(false);
                        }
                    }

                    self.skip_whitespace()?;
                    if self.peek()? == Some(b']') {
                        self.bump();
                        if self.wrapped && self.seek_results(true)? {
                            self.state = State::Items { first: true };
                            continue;
                        }
                        self.finish_document()?;
                        self.state = State::Done;
                        return Ok(false);
                    }
                    if !first {
                        self.expect(b',')?;
                        self.skip_whitespace()?;
                    }

                    self.capture_value()?;
                    self.stats.raw_items += 1;
                    self.state = State::Items { first: false };
                    return Ok(true);
                }
            }
        }
    }

    fn decode(&mut self) -> Result<Option<Event>> {
        let raw: RawReport = match serde_json::from_slice(&self.buffer) {
            Ok(raw) => raw,
            Err(err) if err.classify() == Category::Data => {
                self.reject(MalformedRecord::Shape(err.to_string()));
                return Ok(None);
            }
            Err(err) => return Err(self.syntax_error(err.to_string())),
        };
        self.buffer.clear();

        let report_id = match raw.report_number.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.reject(MalformedRecord::MissingIdentifier);
                return Ok(None);
            }
        };

        if !self.seen.insert(&report_id) {
            self.stats.skipped_duplicate += 1;
            tracing::debug!(%report_id, "skipping duplicate report");
            return Ok(None);
        }

        let reactions: BTreeSet<String> = raw
            .reactions
            .unwrap_or_default()
            .iter()
            .map(|reaction| normalize_label(reaction))
            .filter(|label| !label.is_empty())
            .collect();
        if reactions.is_empty() {
            self.stats.skipped_no_reactions += 1;
            tracing::debug!(%report_id, "skipping report without reactions");
            return Ok(None);
        }

        let started = raw.date_started.as_deref().and_then(parse_date);
        let created = raw.date_created.as_deref().and_then(parse_date);
        let date = match self.config.date_source {
            DateSource::Started => started,
            DateSource::Created => created,
            DateSource::StartedOrCreated => started.or(created),
        };

        let outcomes = raw.outcomes.unwrap_or_default();
        let severity = Severity::worst_of(outcomes.iter().map(String::as_str));
        let product = raw
            .products
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(describe_product);

        self.stats.parsed += 1;
        Ok(Some(Event {
            report_id,
            date,
            reactions,
            severity,
            product,
        }))
    }

    fn reject(&mut self, reason: MalformedRecord) {
        self.buffer.clear();
        self.stats.skipped_malformed += 1;
        tracing::debug!(item = self.stats.raw_items, %reason, "skipping malformed report");
    }

    fn log_finished(&self) {
        let stats = self.stats();
        tracing::info!(
            raw = stats.raw_items,
            parsed = stats.parsed,
            malformed = stats.skipped_malformed,
            duplicates = stats.skipped_duplicate,
            no_reactions = stats.skipped_no_reactions,
            probabilistic_dedup = stats.dedup_probabilistic,
            "record stream finished"
        );
        if stats.skipped_malformed > 0 {
            tracing::warn!(
                count = stats.skipped_malformed,
                "malformed reports were skipped"
            );
        }
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_raw() {
                Ok(true) => {}
                Ok(false) => {
                    if !self.finished {
                        self.finished = true;
                        self.log_finished();
                    }
                    return None;
                }
                Err(err) => {
                    self.state = State::Done;
                    return Some(Err(err));
                }
            }
            match self.decode() {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(err) => {
                    self.state = State::Done;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Canonical reaction label: trimmed, lowercase, single-spaced.
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_product(product: RawProduct) -> Option<String> {
    match (product.name_brand, product.industry_name) {
        (Some(name), Some(industry)) => Some(format!("{name} ({industry})")),
        (Some(name), None) => Some(name),
        (None, Some(industry)) => Some(industry),
        (None, None) => None,
    }
}
