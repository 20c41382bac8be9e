//! Placeholder substitution for stored email templates.
//!
//! Templates are admin-edited database rows, so rendering must never fail
//! hard on operator typos: unknown `{{tokens}}` are left verbatim and a
//! malformed block degrades to literal text instead of aborting the email.
//!
//! Supported syntax:
//! - `{{key}}` - replaced with the string form of the bound value
//! - `{{#each key}}...{{/each}}` - repeated once per element of an
//!   array-valued binding; inside the block, object fields are available
//!   as `{{field}}` and scalar elements as `{{this}}`

use serde_json::Value;

/// Variable bindings for one render.
pub type Vars = serde_json::Map<String, Value>;

const EACH_OPEN: &str = "{{#each ";
const EACH_CLOSE: &str = "{{/each}}";

/// Render a template against a variable map.
///
/// Expands `{{#each}}` blocks first, then substitutes simple tokens.
/// Tokens with no binding are left as literal text.
#[must_use]
pub fn render(template: &str, vars: &Vars) -> String {
    substitute_tokens(&expand_each_blocks(template, vars), vars)
}

/// String form of a bound value.
///
/// Currency values are expected to arrive pre-formatted (`X.XX`) via
/// `Price::format_fixed`; this function never reformats numbers.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        // An array or object in scalar position is an operator mistake;
        // render the JSON so the problem is visible in a test send.
        other => other.to_string(),
    }
}

fn expand_each_blocks(template: &str, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find(EACH_OPEN) {
        let after_open = &rest[open + EACH_OPEN.len()..];
        let Some(key_end) = after_open.find("}}") else {
            // Unterminated open tag: emit the remainder untouched.
            break;
        };
        let key = after_open[..key_end].trim();
        let body_start = key_end + 2;
        let Some(close) = after_open[body_start..].find(EACH_CLOSE) else {
            // No matching close tag: leave the block as literal text.
            break;
        };
        let body = &after_open[body_start..body_start + close];

        out.push_str(&rest[..open]);

        match vars.get(key) {
            Some(Value::Array(items)) => {
                for item in items {
                    out.push_str(&expand_element(body, item));
                }
            }
            // Missing or non-array binding: keep the block verbatim.
            _ => {
                let block_len =
                    EACH_OPEN.len() + body_start + close + EACH_CLOSE.len();
                out.push_str(&rest[open..open + block_len]);
            }
        }

        rest = &after_open[body_start + close + EACH_CLOSE.len()..];
    }

    out.push_str(rest);
    out
}

/// Render one `{{#each}}` body for a single array element.
fn expand_element(body: &str, item: &Value) -> String {
    match item {
        Value::Object(fields) => substitute_tokens(body, fields),
        scalar => {
            let mut vars = Vars::new();
            vars.insert("this".to_owned(), scalar.clone());
            substitute_tokens(body, &vars)
        }
    }
}

fn substitute_tokens(template: &str, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let key = after_open[..close].trim();

        out.push_str(&rest[..open]);

        // Block syntax is handled by expand_each_blocks; anything still
        // here (e.g. an orphaned {{/each}}) stays literal.
        let resolved = if key.starts_with('#') || key.starts_with('/') {
            None
        } else {
            vars.get(key)
        };

        match resolved {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }

        rest = &after_open[close + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Vars {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_basic_substitution() {
        let vars = vars(json!({"name": "Jo", "total": "12.00"}));
        assert_eq!(
            render("Hello {{name}}, total {{total}}", &vars),
            "Hello Jo, total 12.00"
        );
    }

    #[test]
    fn test_unknown_token_left_verbatim() {
        let vars = vars(json!({"name": "Jo"}));
        assert_eq!(
            render("Hello {{name}}, code {{missing}}", &vars),
            "Hello Jo, code {{missing}}"
        );
    }

    #[test]
    fn test_each_expansion_in_order() {
        let vars = vars(json!({
            "items": [
                {"name": "A", "qty": 2},
                {"name": "B", "qty": 1},
            ]
        }));
        assert_eq!(
            render("{{#each items}}<li>{{qty}}x {{name}}</li>{{/each}}", &vars),
            "<li>2x A</li><li>1x B</li>"
        );
    }

    #[test]
    fn test_each_scalar_elements() {
        let vars = vars(json!({"tags": ["vegan", "spicy"]}));
        assert_eq!(
            render("{{#each tags}}[{{this}}]{{/each}}", &vars),
            "[vegan][spicy]"
        );
    }

    #[test]
    fn test_each_empty_array() {
        let vars = vars(json!({"items": []}));
        assert_eq!(render("a{{#each items}}x{{/each}}b", &vars), "ab");
    }

    #[test]
    fn test_each_missing_binding_left_verbatim() {
        let vars = Vars::new();
        let template = "{{#each items}}{{name}}{{/each}}";
        assert_eq!(render(template, &vars), template);
    }

    #[test]
    fn test_each_non_array_binding_left_verbatim() {
        let vars = vars(json!({"items": "oops"}));
        let template = "{{#each items}}{{name}}{{/each}}";
        assert_eq!(render(template, &vars), template);
    }

    #[test]
    fn test_unterminated_block_degrades_to_literal() {
        let vars = vars(json!({"items": [1]}));
        let template = "before {{#each items}}{{this}} after";
        assert_eq!(render(template, &vars), template);
    }

    #[test]
    fn test_tokens_around_each_block() {
        let vars = vars(json!({
            "name": "Jo",
            "items": [{"dish": "Pasta"}],
            "total": "9.50",
        }));
        assert_eq!(
            render(
                "Hi {{name}}: {{#each items}}{{dish}}{{/each}} = {{total}}",
                &vars
            ),
            "Hi Jo: Pasta = 9.50"
        );
    }

    #[test]
    fn test_number_and_null_values() {
        let vars = vars(json!({"qty": 3, "note": null}));
        assert_eq!(render("{{qty}} items{{note}}", &vars), "3 items");
    }

    #[test]
    fn test_whitespace_in_token() {
        let vars = vars(json!({"name": "Jo"}));
        assert_eq!(render("Hello {{ name }}", &vars), "Hello Jo");
    }

    #[test]
    fn test_two_each_blocks() {
        let vars = vars(json!({"a": ["1"], "b": ["2"]}));
        assert_eq!(
            render("{{#each a}}{{this}}{{/each}}-{{#each b}}{{this}}{{/each}}", &vars),
            "1-2"
        );
    }
}
