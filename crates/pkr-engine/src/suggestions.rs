//! Fuzzy "did you mean" hints for template errors

use serde_json::Value as JsonValue;

/// Largest edit distance still offered as a hint
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Filters registered by the engine, plus the common MiniJinja builtins
pub const AVAILABLE_FILTERS: &[&str] = &[
    "toyaml",
    "tojson",
    "b64encode",
    "sha256",
    "indent",
    "nindent",
    "quote",
    "required",
    "default",
    "upper",
    "lower",
    "title",
    "replace",
    "trim",
    "join",
    "first",
    "last",
    "length",
    "sort",
    "unique",
    "map",
    "select",
    "reject",
    "selectattr",
    "dictsort",
    "items",
    "int",
    "float",
    "string",
    "list",
    "bool",
    "safe",
    "urlencode",
];

/// Functions available to file templates
pub const AVAILABLE_FUNCTIONS: &[&str] = &[
    "format_image",
    "context_path",
    "kard_path",
    "src_path",
    "make_container_name",
    "make_image_name",
    "data_path",
    "kard_file_content",
    "range",
    "namespace",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub text: String,
    pub distance: usize,
}

/// Candidates within edit distance, best first
pub fn find_closest_matches(input: &str, candidates: &[&str], max_results: usize) -> Vec<Suggestion> {
    let mut found: Vec<Suggestion> = candidates
        .iter()
        .map(|c| Suggestion {
            text: (*c).to_string(),
            distance: strsim::levenshtein(input, c),
        })
        .filter(|s| s.distance > 0 && s.distance <= MAX_SUGGESTION_DISTANCE)
        .collect();

    found.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.text.cmp(&b.text)));
    found.truncate(max_results);
    found
}

fn quoted(matches: &[Suggestion], prefix: &str) -> String {
    matches
        .iter()
        .map(|m| format!("`{prefix}{}`", m.text))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Hint for an undefined dotted path, looked up against the render context
///
/// Walks the path until the first missing segment and compares that segment
/// with the keys present at that level.
pub fn suggest_undefined_variable(path: &str, context: Option<&JsonValue>) -> Option<String> {
    let context = context?;
    let mut current = context;
    let mut walked: Vec<&str> = Vec::new();

    for part in path.split('.') {
        match current.get(part) {
            Some(next) => {
                walked.push(part);
                current = next;
            }
            None => {
                let available: Vec<&str> = current
                    .as_object()
                    .map(|o| o.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                if available.is_empty() {
                    return None;
                }

                let prefix = if walked.is_empty() {
                    String::new()
                } else {
                    format!("{}.", walked.join("."))
                };
                let matches = find_closest_matches(part, &available, 3);
                return Some(if matches.is_empty() {
                    format!(
                        "`{part}` is not defined. Available keys: {}",
                        available.join(", ")
                    )
                } else {
                    format!("Did you mean {}?", quoted(&matches, &prefix))
                });
            }
        }
    }
    None
}

pub fn suggest_unknown_filter(name: &str) -> String {
    let matches = find_closest_matches(name, AVAILABLE_FILTERS, 3);
    if matches.is_empty() {
        format!(
            "Unknown filter `{name}`. Common filters: toyaml, tojson, b64encode, sha256, quote, indent"
        )
    } else {
        format!("Did you mean {}?", quoted(&matches, ""))
    }
}

pub fn suggest_unknown_function(name: &str) -> String {
    let matches = find_closest_matches(name, AVAILABLE_FUNCTIONS, 3);
    if matches.is_empty() {
        format!(
            "Unknown function `{name}`. Available functions: {}",
            AVAILABLE_FUNCTIONS.join(", ")
        )
    } else {
        format!("Did you mean {}?", quoted(&matches, ""))
    }
}

/// First name quoted with backticks or quotes in an error message
pub fn extract_quoted_name(msg: &str) -> Option<String> {
    for delim in ['`', '\'', '"'] {
        if let Some(start) = msg.find(delim) {
            let rest = &msg[start + 1..];
            if let Some(end) = rest.find(delim) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_closest_matches() {
        let matches = find_closest_matches("toyml", AVAILABLE_FILTERS, 3);
        assert_eq!(matches[0].text, "toyaml");
        assert_eq!(matches[0].distance, 1);
    }

    #[test]
    fn test_exact_match_is_not_a_suggestion() {
        assert!(find_closest_matches("quote", &["quote"], 3).is_empty());
    }

    #[test]
    fn test_suggest_top_level_key() {
        let ctx = json!({"project_name": "demo", "tag": "1.0"});
        let hint = suggest_undefined_variable("project_nam", Some(&ctx)).unwrap();
        assert_eq!(hint, "Did you mean `project_name`?");
    }

    #[test]
    fn test_suggest_nested_key() {
        let ctx = json!({"driver": {"docker_compose": {"compose_file": "c.yml"}}});
        let hint = suggest_undefined_variable("driver.docker_compose.compose_fil", Some(&ctx))
            .unwrap();
        assert!(hint.contains("`driver.docker_compose.compose_file`"));
    }

    #[test]
    fn test_suggest_lists_available_keys_when_nothing_close() {
        let ctx = json!({"tag": "1.0"});
        let hint = suggest_undefined_variable("registry", Some(&ctx)).unwrap();
        assert!(hint.contains("Available keys: tag"));
    }

    #[test]
    fn test_suggest_unknown_filter() {
        assert!(suggest_unknown_filter("b64encod").contains("`b64encode`"));
    }

    #[test]
    fn test_extract_quoted_name() {
        assert_eq!(
            extract_quoted_name("unknown filter `toyml`"),
            Some("toyml".to_string())
        );
        assert_eq!(extract_quoted_name("no name here"), None);
    }
}
