//! URI pattern router with specificity-based conflict detection (component C5).
//!
//! Patterns are parsed into the segment model of §3 and indexed into a path
//! trie per §4.5 rather than matched with regular expressions; specificity
//! is ranked once at registration time so matching never needs to sort
//! candidates on the hot path — it just filters and picks the max.

use std::collections::{HashMap, HashSet};

use percent_encoding::percent_decode_str;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Label(String),
    Greedy(String),
}

/// A required `key=value` query constraint, plus whether the value compares
/// case-insensitively.
#[derive(Debug, Clone)]
struct RequiredLiteral {
    key: String,
    value: String,
    case_insensitive: bool,
}

/// The query half of a terminal's match requirement: literal constraints
/// that must be present, named captures that must be present (with any
/// value), and whether unrecognized extra parameters are tolerated.
#[derive(Debug, Clone, Default)]
pub struct QueryPattern {
    required: Vec<RequiredLiteral>,
    captures: Vec<(String, String)>,
    allow_unknown: bool,
}

impl QueryPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_literal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.push(RequiredLiteral {
            key: key.into(),
            value: value.into(),
            case_insensitive: false,
        });
        self
    }

    pub fn require_literal_ci(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.push(RequiredLiteral {
            key: key.into(),
            value: value.into(),
            case_insensitive: true,
        });
        self
    }

    pub fn capture(mut self, query_key: impl Into<String>, label_name: impl Into<String>) -> Self {
        self.captures.push((query_key.into(), label_name.into()));
        self
    }

    pub fn allow_unknown_params(mut self, allow: bool) -> Self {
        self.allow_unknown = allow;
        self
    }

    fn required_literal_count(&self) -> usize {
        self.required.len()
    }

    /// Returns the captured label values on success, or `None` if a
    /// required literal or capture is missing.
    fn matches(&self, parsed: &[(String, String)]) -> Option<HashMap<String, Vec<String>>> {
        for req in &self.required {
            let present = parsed.iter().any(|(k, v)| {
                k == &req.key
                    && if req.case_insensitive {
                        v.eq_ignore_ascii_case(&req.value)
                    } else {
                        v == &req.value
                    }
            });
            if !present {
                return None;
            }
        }
        let mut captured = HashMap::new();
        for (query_key, label_name) in &self.captures {
            let values: Vec<String> = parsed
                .iter()
                .filter(|(k, _)| k == query_key)
                .map(|(_, v)| v.clone())
                .collect();
            if values.is_empty() {
                return None;
            }
            captured.insert(label_name.clone(), values);
        }
        Some(captured)
    }

    /// Disjoint required-literal sets distinguish two otherwise-conflicting
    /// path patterns (§4.5): if either side requires a literal the other
    /// does not, a request can satisfy at most one of them.
    fn distinguishes(&self, other: &QueryPattern) -> bool {
        self.required
            .iter()
            .any(|r| !other.required.iter().any(|o| o.key == r.key && o.value == r.value))
            || other
                .required
                .iter()
                .any(|r| !self.required.iter().any(|o| o.key == r.key && o.value == r.value))
    }
}

fn parse_raw_query(raw_query: &str) -> Vec<(String, String)> {
    if raw_query.is_empty() {
        return Vec::new();
    }
    raw_query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum RouterBuildError {
    #[error("path pattern '{0}' declares the same label name more than once")]
    DuplicateLabel(String),
    #[error("path pattern '{0}' has a segment after its greedy label")]
    GreedyNotLast(String),
    #[error("patterns for {method} '{a}' and '{b}' are an equivalent conflict")]
    EquivalentConflict { method: String, a: String, b: String },
}

/// One registered `(method, path, query)` pattern.
#[derive(Debug, Clone)]
pub struct UriPattern {
    method: String,
    template: String,
    segments: Vec<Segment>,
    query: QueryPattern,
}

impl UriPattern {
    pub fn new(
        method: impl Into<String>,
        path_template: impl Into<String>,
        query: QueryPattern,
    ) -> Result<Self, RouterBuildError> {
        let template = path_template.into();
        let segments = parse_path(&template)?;
        Ok(UriPattern {
            method: method.into().to_uppercase(),
            template,
            segments,
            query,
        })
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    fn has_greedy(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Greedy(_)))
    }

    /// `(literal segments, required query literals, absence of a greedy
    /// label)` — compared lexicographically, higher wins (§4.5).
    fn specificity(&self) -> (usize, usize, bool) {
        (
            self.literal_count(),
            self.query.required_literal_count(),
            !self.has_greedy(),
        )
    }
}

fn parse_path(template: &str) -> Result<Vec<Segment>, RouterBuildError> {
    let trimmed = template.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut seen_names = HashSet::new();
    let mut greedy_seen = false;

    for raw in trimmed.split('/') {
        if greedy_seen {
            return Err(RouterBuildError::GreedyNotLast(template.to_owned()));
        }
        if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let (name, greedy) = match inner.strip_suffix('+') {
                Some(stripped) => (stripped, true),
                None => (inner, false),
            };
            if !seen_names.insert(name.to_string()) {
                return Err(RouterBuildError::DuplicateLabel(name.to_string()));
            }
            if greedy {
                greedy_seen = true;
                segments.push(Segment::Greedy(name.to_string()));
            } else {
                segments.push(Segment::Label(name.to_string()));
            }
        } else {
            segments.push(Segment::Literal(raw.to_string()));
        }
    }
    Ok(segments)
}

/// Two patterns conflict iff walking their segments pairwise never finds an
/// incompatibility (literal mismatch) and they reach the end at the same
/// time (or one ends in a greedy label, which subsumes whatever remains of
/// the other).
fn path_conflicts(a: &[Segment], b: &[Segment]) -> bool {
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (None, None) => return true,
            (Some(Segment::Greedy(_)), _) | (_, Some(Segment::Greedy(_))) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(Segment::Literal(x)), Some(Segment::Literal(y))) => {
                if x != y {
                    return false;
                }
            }
            _ => {} // a label is compatible with anything for this one segment
        }
        i += 1;
    }
}

/// A structural/query overlap between two patterns only matters if
/// specificity (§4.5 rule 4) wouldn't already rank them apart at match
/// time — two patterns with different literal counts, required-query-literal
/// counts, or greedy-absence are never an `EQUIVALENT_CONFLICT`, even if
/// their segments overlap, because the router can always pick the more
/// specific one.
fn conflicts(a: &UriPattern, b: &UriPattern) -> bool {
    a.method == b.method
        && a.specificity() == b.specificity()
        && path_conflicts(&a.segments, &b.segments)
        && !a.query.distinguishes(&b.query)
}

struct RouteEntry<T> {
    pattern: UriPattern,
    operation: T,
}

#[derive(Default)]
struct RouteGroup<T> {
    routes: Vec<RouteEntry<T>>,
}

#[derive(Default)]
struct Node<T> {
    literal_children: HashMap<String, Node<T>>,
    label_child: Option<Box<Node<T>>>,
    greedy_terminal: Option<RouteGroup<T>>,
    terminal: Option<RouteGroup<T>>,
}

impl<T> Node<T> {
    fn insert(&mut self, segments: &[Segment], entry: RouteEntry<T>) {
        match segments.first() {
            None => self.terminal.get_or_insert_with(RouteGroup::default).routes.push(entry),
            Some(Segment::Literal(s)) => self
                .literal_children
                .entry(s.clone())
                .or_default()
                .insert(&segments[1..], entry),
            Some(Segment::Label(_)) => self
                .label_child
                .get_or_insert_with(Box::default)
                .insert(&segments[1..], entry),
            Some(Segment::Greedy(_)) => {
                self.greedy_terminal.get_or_insert_with(RouteGroup::default).routes.push(entry)
            }
        }
    }

    fn collect<'a>(&'a self, input: &[&str], depth: usize, out: &mut Vec<&'a RouteEntry<T>>) {
        if depth == input.len() {
            if let Some(group) = &self.terminal {
                out.extend(group.routes.iter());
            }
            return;
        }
        if let Some(group) = &self.greedy_terminal {
            out.extend(group.routes.iter());
        }
        if let Some(child) = self.literal_children.get(input[depth]) {
            child.collect(input, depth + 1, out);
        }
        if let Some(child) = &self.label_child {
            child.collect(input, depth + 1, out);
        }
    }
}

/// Why a `(method, path, query)` triple failed to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteFailure {
    NotFound,
    MethodNotAllowed,
    BadQuery,
}

pub struct MatchResult<'a, T> {
    pub operation: &'a T,
    pub labels: HashMap<String, Vec<String>>,
}

pub struct RouterBuilder<T> {
    allow_empty_segments: bool,
    patterns: Vec<UriPattern>,
    operations: Vec<T>,
}

impl<T> Default for RouterBuilder<T> {
    fn default() -> Self {
        RouterBuilder {
            allow_empty_segments: false,
            patterns: Vec::new(),
            operations: Vec::new(),
        }
    }
}

impl<T> RouterBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_empty_segments(mut self, allow: bool) -> Self {
        self.allow_empty_segments = allow;
        self
    }

    pub fn register(mut self, pattern: UriPattern, operation: T) -> Self {
        self.patterns.push(pattern);
        self.operations.push(operation);
        self
    }

    pub fn build(self) -> Result<Router<T>, RouterBuildError> {
        for i in 0..self.patterns.len() {
            for j in (i + 1)..self.patterns.len() {
                if conflicts(&self.patterns[i], &self.patterns[j]) {
                    return Err(RouterBuildError::EquivalentConflict {
                        method: self.patterns[i].method.clone(),
                        a: self.patterns[i].template.clone(),
                        b: self.patterns[j].template.clone(),
                    });
                }
            }
        }

        let mut root = Node::default();
        for (pattern, operation) in self.patterns.into_iter().zip(self.operations.into_iter()) {
            let segments = pattern.segments.clone();
            root.insert(&segments, RouteEntry { pattern, operation });
        }

        Ok(Router {
            root,
            allow_empty_segments: self.allow_empty_segments,
        })
    }
}

/// A built, read-only router: no synchronization is needed for concurrent
/// matches once `build()` has returned (§5).
pub struct Router<T> {
    root: Node<T>,
    allow_empty_segments: bool,
}

impl<T> Router<T> {
    pub fn builder() -> RouterBuilder<T> {
        RouterBuilder::new()
    }

    pub fn match_request(
        &self,
        method: &str,
        path: &str,
        raw_query: &str,
    ) -> Result<MatchResult<'_, T>, RouteFailure> {
        let trimmed = path.trim_matches('/');
        let input: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };
        if !self.allow_empty_segments && input.iter().any(|s| s.is_empty()) {
            return Err(RouteFailure::NotFound);
        }

        let mut candidates = Vec::new();
        self.root.collect(&input, 0, &mut candidates);
        if candidates.is_empty() {
            return Err(RouteFailure::NotFound);
        }

        let method = method.to_uppercase();
        let method_matches: Vec<&RouteEntry<T>> =
            candidates.into_iter().filter(|c| c.pattern.method == method).collect();
        if method_matches.is_empty() {
            return Err(RouteFailure::MethodNotAllowed);
        }

        let parsed_query = parse_raw_query(raw_query);
        let mut best: Option<(&RouteEntry<T>, HashMap<String, Vec<String>>)> = None;
        for entry in &method_matches {
            if let Some(query_labels) = entry.pattern.query.matches(&parsed_query) {
                let better = match &best {
                    None => true,
                    Some((current, _)) => entry.pattern.specificity() > current.pattern.specificity(),
                };
                if better {
                    best = Some((entry, query_labels));
                }
            }
        }

        let (entry, mut labels) = best.ok_or(RouteFailure::BadQuery)?;
        bind_path_labels(&entry.pattern.segments, &input, &mut labels);

        Ok(MatchResult {
            operation: &entry.operation,
            labels,
        })
    }
}

fn bind_path_labels(segments: &[Segment], input: &[&str], labels: &mut HashMap<String, Vec<String>>) {
    let mut i = 0;
    for segment in segments {
        match segment {
            Segment::Literal(_) => i += 1,
            Segment::Label(name) => {
                labels.insert(name.clone(), vec![decode(input[i])]);
                i += 1;
            }
            Segment::Greedy(name) => {
                let value = input[i..].iter().map(|s| decode(s)).collect::<Vec<_>>().join("/");
                labels.insert(name.clone(), vec![value]);
                i = input.len();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(method: &str, path: &str) -> UriPattern {
        UriPattern::new(method, path, QueryPattern::new()).unwrap()
    }

    #[test]
    fn literal_beats_label_by_specificity() {
        let router = Router::builder()
            .register(pattern("GET", "/foo/{bar}"), "A")
            .register(pattern("GET", "/foo/baz"), "B")
            .build()
            .unwrap();

        let baz = router.match_request("GET", "/foo/baz", "").unwrap();
        assert_eq!(*baz.operation, "B");

        let xyz = router.match_request("GET", "/foo/xyz", "").unwrap();
        assert_eq!(*xyz.operation, "A");
        assert_eq!(xyz.labels.get("bar"), Some(&vec!["xyz".to_string()]));
    }

    #[test]
    fn greedy_label_consumes_remainder_with_internal_slashes() {
        let router = Router::builder()
            .register(pattern("GET", "/static/{path+}"), "Static")
            .build()
            .unwrap();

        let m = router.match_request("GET", "/static/a/b/c", "").unwrap();
        assert_eq!(m.labels.get("path"), Some(&vec!["a/b/c".to_string()]));
    }

    #[test]
    fn equivalent_conflict_fails_at_build_time() {
        let err = Router::<&str>::builder()
            .register(pattern("GET", "/x/{a}"), "A")
            .register(pattern("GET", "/x/{b}"), "B")
            .build()
            .unwrap_err();
        assert!(matches!(err, RouterBuildError::EquivalentConflict { .. }));
    }

    #[test]
    fn required_literal_disambiguates_otherwise_conflicting_patterns() {
        let a = UriPattern::new(
            "GET",
            "/items",
            QueryPattern::new().require_literal("view", "summary"),
        )
        .unwrap();
        let b = UriPattern::new(
            "GET",
            "/items",
            QueryPattern::new().require_literal("view", "detail"),
        )
        .unwrap();
        let router = Router::builder().register(a, "Summary").register(b, "Detail").build().unwrap();

        assert_eq!(*router.match_request("GET", "/items", "view=summary").unwrap().operation, "Summary");
        assert_eq!(*router.match_request("GET", "/items", "view=detail").unwrap().operation, "Detail");
    }

    #[test]
    fn method_not_allowed_when_path_matches_but_method_does_not() {
        let router = Router::builder().register(pattern("GET", "/x"), "A").build().unwrap();
        assert_eq!(
            router.match_request("POST", "/x", "").unwrap_err(),
            RouteFailure::MethodNotAllowed
        );
    }

    #[test]
    fn query_param_without_value_is_treated_as_empty_string() {
        let pat = UriPattern::new("GET", "/x", QueryPattern::new().capture("flag", "flag")).unwrap();
        let router = Router::builder().register(pat, "A").build().unwrap();
        let m = router.match_request("GET", "/x", "flag").unwrap();
        assert_eq!(m.labels.get("flag"), Some(&vec!["".to_string()]));
    }

    #[test]
    fn consecutive_slashes_rejected_unless_opted_in() {
        let router = Router::builder().register(pattern("GET", "/a/{b}"), "A").build().unwrap();
        assert_eq!(
            router.match_request("GET", "/a//x", "").unwrap_err(),
            RouteFailure::NotFound
        );
    }

    #[test]
    fn greedy_must_be_last_segment() {
        let err = UriPattern::new("GET", "/{rest+}/more", QueryPattern::new()).unwrap_err();
        assert!(matches!(err, RouterBuildError::GreedyNotLast(_)));
    }

    #[test]
    fn duplicate_label_names_are_rejected() {
        let err = UriPattern::new("GET", "/{id}/{id}", QueryPattern::new()).unwrap_err();
        assert!(matches!(err, RouterBuildError::DuplicateLabel(_)));
    }
}
