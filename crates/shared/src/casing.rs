//! Identifier casing helpers.
//!
//! Every conversion goes through [`split_words`], so any convention can be
//! converted back to snake_case without knowing where it came from.

/// Initialisms that Go keeps fully upper-case (`PlayerID`, not `PlayerId`)
pub const GO_INITIALISMS: &[&str] = &["ID", "URL", "HTTP", "JSON", "API", "UUID"];

/// Split an identifier into lower-case words.
///
/// Handles separators (`_`, `-`, space), camel humps and acronym runs, so
/// `entity_id`, `EntityId`, `entityId` and `EntityID` all yield
/// `["entity", "id"]`.
pub fn split_words(ident: &str) -> Vec<String> {
    let chars: Vec<char> = ident.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == '-' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let hump = prev.is_lowercase() || prev.is_ascii_digit();
            let acronym_end = prev.is_uppercase() && next_is_lower;
            if hump || acronym_end {
                words.push(std::mem::take(&mut current));
            }
        }

        current.extend(c.to_lowercase());
    }

    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn to_snake_case(ident: &str) -> String {
    split_words(ident).join("_")
}

/// Join rendered words, keeping a `_` wherever the boundary would otherwise
/// be lost on the way back through [`split_words`]: before a word that starts
/// with a digit, and between two words `upper_run` reports as all-caps.
fn join_words(
    words: &[String],
    render: impl Fn(usize, &str) -> String,
    upper_run: impl Fn(&str) -> bool,
) -> String {
    let mut out = String::new();
    let mut prev_upper = false;
    for (i, word) in words.iter().enumerate() {
        let starts_with_digit = word.chars().next().is_some_and(|c| c.is_ascii_digit());
        let upper = upper_run(word);
        if i > 0 && (starts_with_digit || (prev_upper && upper)) {
            out.push('_');
        }
        out.push_str(&render(i, word));
        prev_upper = upper;
    }
    out
}

pub fn to_pascal_case(ident: &str) -> String {
    join_words(&split_words(ident), |_, w| capitalize(w), |_| false)
}

pub fn to_camel_case(ident: &str) -> String {
    join_words(
        &split_words(ident),
        |i, w| if i == 0 { w.to_string() } else { capitalize(w) },
        |_| false,
    )
}

fn is_go_initialism(word: &str) -> bool {
    GO_INITIALISMS.contains(&word.to_uppercase().as_str())
}

/// PascalCase with Go initialisms upper-cased.
pub fn to_go_case(ident: &str) -> String {
    join_words(
        &split_words(ident),
        |_, w| {
            if is_go_initialism(w) {
                w.to_uppercase()
            } else {
                capitalize(w)
            }
        },
        is_go_initialism,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_every_convention() {
        for ident in ["entity_id", "EntityId", "entityId", "EntityID", "entity-id"] {
            assert_eq!(split_words(ident), vec!["entity", "id"], "{ident}");
        }
        assert_eq!(split_words("HTTPServerURL"), vec!["http", "server", "url"]);
        assert_eq!(split_words("vec2Value"), vec!["vec2", "value"]);
    }

    #[test]
    fn conversions() {
        assert_eq!(to_pascal_case("last_split_time"), "LastSplitTime");
        assert_eq!(to_camel_case("last_split_time"), "lastSplitTime");
        assert_eq!(to_go_case("player_id"), "PlayerID");
        assert_eq!(to_go_case("api_url"), "API_URL");
        assert_eq!(to_go_case("api_server"), "APIServer");
        assert_eq!(to_snake_case("PlayerID"), "player_id");
        assert_eq!(to_snake_case("createdAt"), "created_at");
    }

    #[test]
    fn digit_led_words_keep_their_boundary() {
        assert_eq!(to_pascal_case("slot_2"), "Slot_2");
        assert_eq!(to_camel_case("level_10_score"), "level_10Score");
        assert_eq!(to_go_case("slot_2_id"), "Slot_2ID");
        assert_eq!(to_pascal_case("vec2_value"), "Vec2Value");

        for ident in ["slot_2", "level_10_score", "api_url", "vec2_value", "user_id_url"] {
            assert_eq!(to_snake_case(&to_pascal_case(ident)), ident);
            assert_eq!(to_snake_case(&to_camel_case(ident)), ident);
            assert_eq!(to_snake_case(&to_go_case(ident)), ident);
        }
    }

    #[test]
    fn single_letter_keys_survive() {
        assert_eq!(to_pascal_case("x"), "X");
        assert_eq!(to_snake_case("X"), "x");
        assert_eq!(to_go_case("id"), "ID");
        assert_eq!(to_snake_case("ID"), "id");
    }
}
