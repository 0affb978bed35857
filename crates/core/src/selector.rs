//! Kubernetes label selectors evaluated against cached labels.
//!
//! Supports equality (`k=v`, `k==v`, `k!=v`), existence (`k`, `!k`) and set
//! (`k in (a,b)`, `k notin (a,b)`) requirements joined by commas.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty requirement in selector {0:?}")]
    Empty(String),
    #[error("unbalanced parentheses in selector {0:?}")]
    Unbalanced(String),
    #[error("invalid requirement {0:?}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    fn matches(&self, labels: &[(String, String)]) -> bool {
        let get = |k: &str| labels.iter().find(|(lk, _)| lk == k).map(|(_, v)| v.as_str());
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            // Absent keys satisfy != (Kubernetes semantics)
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
            Requirement::In(k, vs) => get(k).map(|v| vs.iter().any(|x| x == v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => get(k).map(|v| !vs.iter().any(|x| x == v)).unwrap_or(true),
        }
    }
}

/// Parsed label selector. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    source: String,
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let mut reqs = Vec::new();
        for part in split_top_level(trimmed)? {
            reqs.push(parse_requirement(part.trim())?);
        }
        Ok(Self { source: trimmed.to_string(), reqs })
    }

    pub fn is_everything(&self) -> bool {
        self.reqs.is_empty()
    }

    /// The selector as given, suitable for a server-side `labelSelector` parameter.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, labels: &[(String, String)]) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

fn split_top_level(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorError::Unbalanced(s.to_string()));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    out.push(&s[start..]);
    if out.iter().any(|p| p.trim().is_empty()) {
        return Err(SelectorError::Empty(s.to_string()));
    }
    Ok(out)
}

fn parse_set(key: &str, rest: &str, raw: &str) -> Result<(String, Vec<String>), SelectorError> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| SelectorError::Invalid(raw.to_string()))?;
    let values: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        return Err(SelectorError::Invalid(raw.to_string()));
    }
    Ok((key.to_string(), values))
}

fn valid_key(k: &str) -> bool {
    !k.is_empty() && !k.contains(|c: char| c.is_whitespace() || c == '=' || c == '!' || c == '(' || c == ')')
}

fn parse_requirement(raw: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = raw.strip_prefix('!') {
        let key = key.trim();
        if !valid_key(key) {
            return Err(SelectorError::Invalid(raw.to_string()));
        }
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if let Some((k, v)) = raw.split_once("!=") {
        let k = k.trim();
        if !valid_key(k) {
            return Err(SelectorError::Invalid(raw.to_string()));
        }
        return Ok(Requirement::NotEquals(k.to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = raw.split_once("==").or_else(|| raw.split_once('=')) {
        let k = k.trim();
        if !valid_key(k) {
            return Err(SelectorError::Invalid(raw.to_string()));
        }
        return Ok(Requirement::Equals(k.to_string(), v.trim().to_string()));
    }
    let mut words = raw.splitn(2, char::is_whitespace);
    let key = words.next().unwrap_or("").trim();
    let rest = words.next().unwrap_or("").trim();
    if rest.is_empty() {
        if !valid_key(key) {
            return Err(SelectorError::Invalid(raw.to_string()));
        }
        return Ok(Requirement::Exists(key.to_string()));
    }
    if let Some(set) = rest.strip_prefix("notin") {
        let (k, vs) = parse_set(key, set, raw)?;
        return Ok(Requirement::NotIn(k, vs));
    }
    if let Some(set) = rest.strip_prefix("in") {
        let (k, vs) = parse_set(key, set, raw)?;
        return Ok(Requirement::In(k, vs));
    }
    Err(SelectorError::Invalid(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_matches_everything() {
        let s = LabelSelector::parse("  ").unwrap();
        assert!(s.is_everything());
        assert!(s.matches(&labels(&[])));
    }

    #[test]
    fn equality_and_existence() {
        let s = LabelSelector::parse("app=payments,team,!canary").unwrap();
        assert!(s.matches(&labels(&[("app", "payments"), ("team", "pay")])));
        assert!(!s.matches(&labels(&[("app", "payments")])));
        assert!(!s.matches(&labels(&[("app", "payments"), ("team", "pay"), ("canary", "1")])));
        let ne = LabelSelector::parse("app!=payments").unwrap();
        assert!(ne.matches(&labels(&[])));
        assert!(!ne.matches(&labels(&[("app", "payments")])));
    }

    #[test]
    fn set_based() {
        let s = LabelSelector::parse("env in (dev, prod),tier notin (batch)").unwrap();
        assert!(s.matches(&labels(&[("env", "dev")])));
        assert!(!s.matches(&labels(&[("env", "test")])));
        assert!(!s.matches(&labels(&[("env", "prod"), ("tier", "batch")])));
    }

    #[test]
    fn rejects_garbage() {
        assert!(LabelSelector::parse("a in (b").is_err());
        assert!(LabelSelector::parse("a,,b").is_err());
        assert!(LabelSelector::parse("a in b").is_err());
    }
}
