use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::bytes::{Regex, RegexBuilder};

use tracing::{debug, warn};

use super::chunk::Chunk;
use super::xpath::QuerySet;
use crate::config::{MatchMode, SearchRequest};
use crate::errors::{SearchError, SearchResult};
use crate::results::MatchHit;

/// Bytes of context kept on each side of a hit
pub const SNIPPET_CONTEXT: usize = 50;

/// A hit inside one chunk, before it is placed in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHit {
    pub term_index: usize,
    pub start: usize,
    pub end: usize,
}

/// How a literal keyword set is searched
#[derive(Debug, Clone)]
enum LiteralSearch {
    Automaton(AhoCorasick),
    /// Unicode case folding, one escaped byte regex per keyword
    Folded(PatternMatcher),
}

/// Literal keyword set compiled into one automaton
#[derive(Debug, Clone)]
pub struct LiteralMatcher {
    search: LiteralSearch,
    keywords: Vec<String>,
}

impl LiteralMatcher {
    pub fn new(keywords: Vec<String>, case_sensitive: bool) -> SearchResult<Self> {
        // The automaton only folds ASCII letters
        let search = if !case_sensitive && keywords.iter().any(|k| !k.is_ascii()) {
            let escaped = keywords.iter().map(|k| regex::escape(k)).collect();
            LiteralSearch::Folded(PatternMatcher::new(escaped, false)?)
        } else {
            let automaton = AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .ascii_case_insensitive(!case_sensitive)
                .build(&keywords)
                .map_err(|e| SearchError::invalid_pattern(e.to_string()))?;
            LiteralSearch::Automaton(automaton)
        };
        Ok(Self { search, keywords })
    }

    fn scan(&self, haystack: &[u8], hits: &mut Vec<RawHit>) {
        match &self.search {
            LiteralSearch::Automaton(automaton) => {
                hits.extend(automaton.find_overlapping_iter(haystack).map(|m| RawHit {
                    term_index: m.pattern().as_usize(),
                    start: m.start(),
                    end: m.end(),
                }))
            }
            LiteralSearch::Folded(patterns) => patterns.scan(haystack, hits),
        }
    }
}

/// One compiled byte regex per pattern
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    patterns: Vec<Regex>,
    sources: Vec<String>,
}

impl PatternMatcher {
    /// Compiles each pattern. One that is not a valid regular expression is
    /// searched for as literal text instead.
    pub fn new(sources: Vec<String>, case_sensitive: bool) -> SearchResult<Self> {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
        };
        let patterns = sources
            .iter()
            .map(|source| match build(source) {
                Ok(regex) => Ok(regex),
                Err(e) => {
                    warn!("Invalid regex '{}', matching it literally: {}", source, e);
                    build(&regex::escape(source))
                        .map_err(|e| SearchError::invalid_pattern(format!("{}: {}", source, e)))
                }
            })
            .collect::<SearchResult<Vec<_>>>()?;
        Ok(Self { patterns, sources })
    }

    fn scan(&self, haystack: &[u8], hits: &mut Vec<RawHit>) {
        for (index, regex) in self.patterns.iter().enumerate() {
            hits.extend(
                regex
                    .find_iter(haystack)
                    .filter(|m| m.end() > m.start())
                    .map(|m| RawHit {
                        term_index: index,
                        start: m.start(),
                        end: m.end(),
                    }),
            );
        }
    }
}

/// The run's match strategy, chosen once from the request
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(LiteralMatcher),
    Pattern(PatternMatcher),
    Structured(QuerySet),
}

impl Matcher {
    /// Compiles the request's keywords. Invalid queries fail here, before
    /// any file is touched.
    pub fn from_request(request: &SearchRequest) -> SearchResult<Self> {
        let keywords = request.normalized_keywords();
        if keywords.is_empty() {
            return Err(SearchError::config_error("at least one keyword is required"));
        }
        Ok(match request.mode {
            MatchMode::Literal => Self::Literal(LiteralMatcher::new(keywords, request.case_sensitive)?),
            MatchMode::Regex => Self::Pattern(PatternMatcher::new(keywords, request.case_sensitive)?),
            MatchMode::Xpath => {
                debug!("Compiling {} XPath queries", keywords.len());
                Self::Structured(QuerySet::compile(&keywords)?)
            }
        })
    }

    pub fn term(&self, index: usize) -> &str {
        match self {
            Self::Literal(m) => &m.keywords[index],
            Self::Pattern(m) => &m.sources[index],
            Self::Structured(_) => "",
        }
    }

    /// Starts a scan of one file
    pub fn scanner(&self) -> ChunkScanner<'_> {
        ChunkScanner {
            matcher: self,
            reported_end: vec![0; self.term_count()],
            held: Vec::new(),
        }
    }

    fn term_count(&self) -> usize {
        match self {
            Self::Literal(m) => m.keywords.len(),
            Self::Pattern(m) => m.sources.len(),
            Self::Structured(_) => 0,
        }
    }

    fn scan_raw(&self, data: &[u8]) -> Vec<RawHit> {
        let mut hits = Vec::new();
        match self {
            Self::Literal(m) => m.scan(data, &mut hits),
            Self::Pattern(m) => m.scan(data, &mut hits),
            Self::Structured(_) => {}
        }
        hits.sort_by_key(|hit| (hit.start, hit.term_index));
        hits
    }

    /// Finds hits in one chunk, leaving out those that lie wholly inside the
    /// overlap prefix: the previous chunk already reported them.
    /// Hits come back ordered by position.
    ///
    /// Only fixed-length keywords are safe to scan chunk by chunk like this;
    /// a file scan goes through [`Matcher::scanner`].
    pub fn scan_chunk(&self, chunk: &Chunk<'_>) -> Vec<RawHit> {
        let mut hits = self.scan_raw(chunk.data);
        hits.retain(|hit| hit.end > chunk.overlap);
        hits
    }

    /// Places a chunk hit in the file and cuts its snippet
    pub fn to_match_hit(&self, chunk: &Chunk<'_>, hit: RawHit) -> MatchHit {
        let from = hit.start.saturating_sub(SNIPPET_CONTEXT);
        let to = (hit.end + SNIPPET_CONTEXT).min(chunk.data.len());
        MatchHit {
            term: self.term(hit.term_index).to_string(),
            term_index: hit.term_index,
            offset: chunk.offset + hit.start as u64,
            line: Some(chunk.line_at(hit.start)),
            snippet: String::from_utf8_lossy(&chunk.data[from..to]).trim().to_string(),
        }
    }
}

/// A pattern hit that touched the end of its chunk
#[derive(Debug)]
struct PendingHit {
    hit: MatchHit,
    end: u64,
}

/// Turns the chunks of one file into hits, each reported once.
///
/// A regex match can run past the end of the chunk it starts in. A pattern
/// hit ending exactly at the chunk's end is held back until the next chunk
/// arrives: if that chunk covers its start, the full match is found there.
/// Hits that start before the end of the last hit reported for the same
/// pattern are dropped.
#[derive(Debug)]
pub struct ChunkScanner<'m> {
    matcher: &'m Matcher,
    reported_end: Vec<u64>,
    held: Vec<PendingHit>,
}

impl ChunkScanner<'_> {
    /// Hits completed by this chunk, ordered by position
    pub fn feed(&mut self, chunk: &Chunk<'_>) -> Vec<MatchHit> {
        if !matches!(self.matcher, Matcher::Pattern(_)) {
            return self
                .matcher
                .scan_chunk(chunk)
                .into_iter()
                .map(|raw| self.matcher.to_match_hit(chunk, raw))
                .collect();
        }

        let mut found = Vec::new();
        for pending in std::mem::take(&mut self.held) {
            // Starts before this chunk, so it cannot be found again
            if pending.hit.offset < chunk.offset {
                self.report(pending, &mut found);
            }
        }
        for raw in self.matcher.scan_raw(chunk.data) {
            let end = chunk.offset + raw.end as u64;
            if chunk.offset + (raw.start as u64) < self.reported_end[raw.term_index] {
                continue;
            }
            let pending = PendingHit {
                hit: self.matcher.to_match_hit(chunk, raw),
                end,
            };
            if raw.end == chunk.data.len() {
                self.held.push(pending);
            } else {
                self.report(pending, &mut found);
            }
        }
        found
    }

    /// Hits still held back once the file has ended
    pub fn finish(&mut self) -> Vec<MatchHit> {
        let mut found = Vec::new();
        for pending in std::mem::take(&mut self.held) {
            self.report(pending, &mut found);
        }
        found
    }

    fn report(&mut self, pending: PendingHit, found: &mut Vec<MatchHit>) {
        let reported = &mut self.reported_end[pending.hit.term_index];
        *reported = (*reported).max(pending.end);
        found.push(pending.hit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(keywords: &[&str], mode: MatchMode) -> SearchRequest {
        SearchRequest {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            mode,
            ..Default::default()
        }
    }

    fn whole(data: &[u8]) -> Chunk<'_> {
        Chunk {
            data,
            offset: 0,
            overlap: 0,
            lines_before: 0,
        }
    }

    #[test]
    fn test_literal_set_finds_every_keyword() {
        let matcher = Matcher::from_request(&request(&["ERROR", "FATAL"], MatchMode::Literal)).unwrap();
        let hits = matcher.scan_chunk(&whole(b"ok error then FATAL and Error"));
        let terms: Vec<&str> = hits.iter().map(|h| matcher.term(h.term_index)).collect();
        assert_eq!(terms, vec!["ERROR", "FATAL", "ERROR"]);
    }

    #[test]
    fn test_literal_case_sensitive() {
        let mut req = request(&["ERROR"], MatchMode::Literal);
        req.case_sensitive = true;
        let matcher = Matcher::from_request(&req).unwrap();
        assert_eq!(matcher.scan_chunk(&whole(b"error ERROR")).len(), 1);
    }

    #[test]
    fn test_overlapping_keywords() {
        let matcher = Matcher::from_request(&request(&["CODE_4", "CODE_42"], MatchMode::Literal)).unwrap();
        assert_eq!(matcher.scan_chunk(&whole(b"CODE_42")).len(), 2);
    }

    #[test]
    fn test_overlap_prefix_hits_are_not_repeated() {
        let matcher = Matcher::from_request(&request(&["abc"], MatchMode::Literal)).unwrap();
        let chunk = Chunk {
            data: b"abcxxabc",
            offset: 100,
            overlap: 3,
            lines_before: 0,
        };
        let hits = matcher.scan_chunk(&chunk);
        assert_eq!(hits.len(), 1);
        assert_eq!(matcher.to_match_hit(&chunk, hits[0]).offset, 105);

        // Straddling the overlap boundary counts for this chunk
        let chunk = Chunk {
            data: b"xabcx",
            offset: 0,
            overlap: 2,
            lines_before: 0,
        };
        assert_eq!(matcher.scan_chunk(&chunk).len(), 1);
    }

    #[test]
    fn test_pattern_matching() {
        let matcher =
            Matcher::from_request(&request(&[r"ERROR_CODE_\d+"], MatchMode::Regex)).unwrap();
        let hits = matcher.scan_chunk(&whole(b"<c>error_code_42</c><c>ERROR_CODE_7</c>"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_non_ascii_keyword_folds_case() {
        let matcher = Matcher::from_request(&request(&["ÉCHEC", "fail"], MatchMode::Literal)).unwrap();
        let hits = matcher.scan_chunk(&whole("<r>échec</r><r>FAIL</r>".as_bytes()));
        let terms: Vec<&str> = hits.iter().map(|h| matcher.term(h.term_index)).collect();
        assert_eq!(terms, vec!["ÉCHEC", "fail"]);

        let mut req = request(&["ÉCHEC"], MatchMode::Literal);
        req.case_sensitive = true;
        let matcher = Matcher::from_request(&req).unwrap();
        assert!(matcher.scan_chunk(&whole("<r>échec</r>".as_bytes())).is_empty());
    }

    #[test]
    fn test_invalid_regex_is_matched_literally() {
        let matcher = Matcher::from_request(&request(&["(unclosed", r"\d+"], MatchMode::Regex)).unwrap();
        assert_eq!(matcher.term(0), "(unclosed");
        let hits = matcher.scan_chunk(&whole(b"<a>(UNCLOSED</a><a>unclosed</a>"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, 3);
    }

    #[test]
    fn test_invalid_query_fails_at_setup() {
        let result = Matcher::from_request(&request(&["/a[1]"], MatchMode::Xpath));
        assert!(matches!(result, Err(SearchError::InvalidQuery { .. })));
    }

    #[test]
    fn test_blank_keywords_rejected() {
        assert!(Matcher::from_request(&request(&["", "  "], MatchMode::Literal)).is_err());
    }

    #[test]
    fn test_match_hit_snippet_and_line() {
        let matcher = Matcher::from_request(&request(&["NEEDLE"], MatchMode::Literal)).unwrap();
        let mut data = b"line one\nline two ".to_vec();
        data.extend(std::iter::repeat(b'x').take(80));
        data.extend_from_slice(b"NEEDLE");
        data.extend(std::iter::repeat(b'y').take(80));
        let chunk = Chunk {
            data: &data,
            offset: 0,
            overlap: 0,
            lines_before: 10,
        };

        let hits = matcher.scan_chunk(&chunk);
        let hit = matcher.to_match_hit(&chunk, hits[0]);
        assert_eq!(hit.line, Some(12));
        assert_eq!(hit.snippet.len(), 50 + 6 + 50);
        assert!(hit.snippet.contains("NEEDLE"));
    }

    fn chunks_of(data: &[u8], size: usize, overlap: usize) -> Vec<Chunk<'_>> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        loop {
            let end = (offset + size).min(data.len());
            chunks.push(Chunk {
                data: &data[offset..end],
                offset: offset as u64,
                overlap: if offset == 0 { 0 } else { overlap },
                lines_before: 0,
            });
            if end == data.len() {
                return chunks;
            }
            offset = end - overlap;
        }
    }

    fn scan_file(matcher: &Matcher, data: &[u8], size: usize, overlap: usize) -> Vec<MatchHit> {
        let mut scanner = matcher.scanner();
        let mut hits = Vec::new();
        for chunk in chunks_of(data, size, overlap) {
            hits.extend(scanner.feed(&chunk));
        }
        hits.extend(scanner.finish());
        hits
    }

    #[test]
    fn test_pattern_hit_across_chunk_end_reported_once() {
        let matcher = Matcher::from_request(&request(&[r"ERROR_CODE_\d+"], MatchMode::Regex)).unwrap();
        let data = format!("{}ERROR_CODE_42{}", "x".repeat(52), "y".repeat(100));

        let hits = scan_file(&matcher, data.as_bytes(), 64, 16);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset, 52);
        assert!(hits[0].snippet.contains("ERROR_CODE_42"));
    }

    #[test]
    fn test_pattern_hit_ending_at_file_end() {
        let matcher = Matcher::from_request(&request(&[r"CODE_\d+"], MatchMode::Regex)).unwrap();
        let data = format!("{}CODE_1 CODE_77", "x".repeat(40));

        let hits = scan_file(&matcher, data.as_bytes(), 32, 8);
        let offsets: Vec<u64> = hits.iter().map(|h| h.offset).collect();
        assert_eq!(offsets, vec![40, 47]);
    }

    #[test]
    fn test_literal_scan_matches_chunk_scan() {
        let matcher = Matcher::from_request(&request(&["abc"], MatchMode::Literal)).unwrap();
        let data = b"abcxxxxabcxxxxxxxxxxxxxxabc".repeat(4);
        let hits = scan_file(&matcher, &data, 16, 4);
        assert_eq!(hits.len(), 12);
        for hit in hits {
            assert_eq!(&data[hit.offset as usize..hit.offset as usize + 3], b"abc");
        }
    }

    #[test]
    fn test_structured_mode_does_not_scan_chunks() {
        let matcher = Matcher::from_request(&request(&["//Code"], MatchMode::Xpath)).unwrap();
        assert!(matches!(matcher, Matcher::Structured(_)));
        assert!(matcher.scan_chunk(&whole(b"<Code/>")).is_empty());
    }
}
