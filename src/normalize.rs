use crate::auth::CallerIdentity;
use crate::overrides::ModelOverrideProfile;
use chrono::{DateTime, Local};
use serde_json::{Map, Value, json};

/// Model id that needs an explicit `max_tokens` to produce full answers.
pub const LEGACY_VISION_MODEL: &str = "gpt-4-vision-preview";
pub const LEGACY_VISION_MAX_TOKENS: u64 = 4000;

/// Rewrites an inbound chat-completion body with the model's override profile.
pub fn normalize(
    payload: &mut Map<String, Value>,
    profile: Option<&ModelOverrideProfile>,
    caller: Option<&CallerIdentity>,
) {
    normalize_at(payload, profile, caller, Local::now());
}

pub fn normalize_at(
    payload: &mut Map<String, Value>,
    profile: Option<&ModelOverrideProfile>,
    caller: Option<&CallerIdentity>,
    now: DateTime<Local>,
) {
    if let Some(profile) = profile {
        apply_profile(payload, profile, caller, now);
    }
    if payload.get("model").and_then(|v| v.as_str()) == Some(LEGACY_VISION_MODEL)
        && !payload.contains_key("max_tokens")
    {
        payload.insert("max_tokens".to_string(), json!(LEGACY_VISION_MAX_TOKENS));
    }
}

fn apply_profile(
    payload: &mut Map<String, Value>,
    profile: &ModelOverrideProfile,
    caller: Option<&CallerIdentity>,
    now: DateTime<Local>,
) {
    if let Some(base) = profile.base_model_id.as_deref().filter(|b| !b.is_empty()) {
        payload.insert("model".to_string(), Value::String(base.to_string()));
    }

    let Some(params) = profile.params.as_object() else {
        return;
    };

    if let Some(temperature) = params.get("temperature").and_then(as_float) {
        payload.insert("temperature".to_string(), json!(temperature));
    }
    for field in ["top_p", "max_tokens", "frequency_penalty"] {
        if let Some(value) = params.get(field).and_then(as_integer) {
            payload.insert(field.to_string(), json!(value));
        }
    }
    if let Some(seed) = params.get("seed").filter(|v| !v.is_null()) {
        payload.insert("seed".to_string(), seed.clone());
    }
    if let Some(stop) = params.get("stop").and_then(decode_stop_list) {
        payload.insert("stop".to_string(), json!(stop));
    }
    if let Some(template) = params
        .get("system")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        let system = render_system_template(template, caller, now);
        inject_system_prompt(payload, &system);
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Integer coercion truncates floats toward zero; non-numeric strings count
/// as absent.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn decode_stop_list(value: &Value) -> Option<Vec<String>> {
    let list: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(unescape)
            .collect(),
        Value::String(s) => vec![unescape(s)],
        _ => return None,
    };
    if list.is_empty() { None } else { Some(list) }
}

/// Interprets backslash escapes (`\n`, `\t`, `\x41`, `é`, octal, ...).
/// Unknown or truncated escapes are kept literally.
pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0C}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0B}'),
            '0'..='7' => {
                let mut code = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            code = code * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
            }
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = chars.clone().take(width).collect();
                let decoded = (digits.len() == width && digits.chars().all(|c| c.is_ascii_hexdigit()))
                    .then(|| u32::from_str_radix(&digits, 16).ok())
                    .flatten()
                    .and_then(char::from_u32);
                match decoded {
                    Some(c) => {
                        out.push(c);
                        for _ in 0..width {
                            chars.next();
                        }
                    }
                    None => {
                        out.push('\\');
                        out.push(next);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

/// Fills the `{{...}}` placeholders of a system prompt template.
pub fn render_system_template(
    template: &str,
    caller: Option<&CallerIdentity>,
    now: DateTime<Local>,
) -> String {
    let date = now.format("%Y-%m-%d").to_string();
    let time = now.format("%I:%M:%S %p").to_string();
    let user_name = caller
        .map(|c| c.name.as_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("Unknown");
    let user_location = caller
        .and_then(|c| c.location.as_deref())
        .filter(|l| !l.is_empty())
        .unwrap_or("Unknown");
    template
        .replace("{{CURRENT_DATETIME}}", &format!("{date} {time}"))
        .replace("{{CURRENT_DATE}}", &date)
        .replace("{{CURRENT_TIME}}", &time)
        .replace("{{USER_NAME}}", user_name)
        .replace("{{USER_LOCATION}}", user_location)
}

/// Prepends `system` to the first system message, or inserts one at the
/// front. Requests without messages are left alone.
fn inject_system_prompt(payload: &mut Map<String, Value>, system: &str) {
    let Some(messages) = payload
        .get_mut("messages")
        .and_then(|v| v.as_array_mut())
        .filter(|m| !m.is_empty())
    else {
        return;
    };

    let existing = messages
        .iter_mut()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("system"));
    match existing.and_then(|m| m.as_object_mut()) {
        Some(message) => {
            let content = message.remove("content").unwrap_or(Value::Null);
            let merged = match content {
                Value::String(text) => Value::String(format!("{system}{text}")),
                Value::Array(mut parts) => {
                    parts.insert(0, json!({ "type": "text", "text": system }));
                    Value::Array(parts)
                }
                _ => Value::String(system.to_string()),
            };
            message.insert("content".to_string(), merged);
        }
        None => messages.insert(0, json!({ "role": "system", "content": system })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile(params: Value) -> ModelOverrideProfile {
        ModelOverrideProfile {
            id: "custom".to_string(),
            base_model_id: None,
            params,
        }
    }

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 14, 3, 9).unwrap()
    }

    fn caller() -> CallerIdentity {
        CallerIdentity {
            id: "u-1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            role: "user".into(),
            location: Some("London".into()),
        }
    }

    #[test]
    fn profile_temperature_fills_missing_field() {
        let mut payload = body(json!({ "model": "custom", "messages": [] }));
        normalize(&mut payload, Some(&profile(json!({ "temperature": 0.2 }))), None);
        assert_eq!(payload["temperature"], json!(0.2));
    }

    #[test]
    fn profile_value_overrides_request_value() {
        let mut payload = body(json!({ "model": "custom", "temperature": 0.9 }));
        normalize(&mut payload, Some(&profile(json!({ "temperature": 0.2 }))), None);
        assert_eq!(payload["temperature"], json!(0.2));
    }

    #[test]
    fn numeric_fields_are_coerced() {
        let mut payload = body(json!({ "model": "custom" }));
        let params = json!({
            "temperature": "1",
            "top_p": 0.9,
            "max_tokens": "256",
            "frequency_penalty": 1.7,
            "seed": "abc"
        });
        normalize(&mut payload, Some(&profile(params)), None);
        assert_eq!(payload["temperature"], json!(1.0));
        assert_eq!(payload["top_p"], json!(0));
        assert_eq!(payload["max_tokens"], json!(256));
        assert_eq!(payload["frequency_penalty"], json!(1));
        assert_eq!(payload["seed"], json!("abc"));
    }

    #[test]
    fn malformed_params_are_ignored() {
        let mut payload = body(json!({ "model": "custom", "max_tokens": 10 }));
        let params = json!({
            "temperature": "warm",
            "max_tokens": "lots",
            "top_p": null,
            "stop": 42,
            "system": 7
        });
        normalize(&mut payload, Some(&profile(params)), None);
        assert!(payload.get("temperature").is_none());
        assert_eq!(payload["max_tokens"], json!(10));
        assert!(payload.get("top_p").is_none());
        assert!(payload.get("stop").is_none());

        let mut untouched = body(json!({ "model": "custom" }));
        normalize(&mut untouched, Some(&profile(json!(["not", "an", "object"]))), None);
        assert_eq!(Value::Object(untouched), json!({ "model": "custom" }));
    }

    #[test]
    fn base_model_alias_replaces_model() {
        let mut payload = body(json!({ "model": "custom" }));
        let mut p = profile(Value::Null);
        p.base_model_id = Some("gpt-4o".to_string());
        normalize(&mut payload, Some(&p), None);
        assert_eq!(payload["model"], "gpt-4o");
    }

    #[test]
    fn stop_sequences_are_unescaped() {
        let mut payload = body(json!({ "model": "custom", "stop": ["x"] }));
        normalize(
            &mut payload,
            Some(&profile(json!({ "stop": ["\\n\\nUser:", "<|end|>", "\\x41\\u00e9"] }))),
            None,
        );
        assert_eq!(payload["stop"], json!(["\n\nUser:", "<|end|>", "Aé"]));
    }

    #[test]
    fn unescape_handles_octal_and_unknown_sequences() {
        assert_eq!(unescape("a\\tb"), "a\tb");
        assert_eq!(unescape("\\101\\0"), "A\0");
        assert_eq!(unescape("\\q"), "\\q");
        assert_eq!(unescape("\\x4"), "\\x4");
        assert_eq!(unescape("trailing\\"), "trailing\\");
        assert_eq!(unescape("say \\\"hi\\\""), "say \"hi\"");
    }

    #[test]
    fn system_prompt_inserted_when_absent() {
        let mut payload = body(json!({
            "model": "custom",
            "messages": [{ "role": "user", "content": "hi" }]
        }));
        let caller = caller();
        normalize_at(
            &mut payload,
            Some(&profile(json!({ "system": "You help {{USER_NAME}} in {{USER_LOCATION}}." }))),
            Some(&caller),
            fixed_now(),
        );
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You help Ada in London.");
        assert_eq!(messages[1]["content"], "hi");
    }

    #[test]
    fn system_prompt_prepended_to_existing_system_message() {
        let mut payload = body(json!({
            "model": "custom",
            "messages": [
                { "role": "user", "content": "first" },
                { "role": "system", "content": "Be brief." },
                { "role": "system", "content": "Second system." }
            ]
        }));
        normalize_at(
            &mut payload,
            Some(&profile(json!({ "system": "Today is {{CURRENT_DATE}}. " }))),
            None,
            fixed_now(),
        );
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"], "Today is 2024-05-17. Be brief.");
        assert_eq!(messages[2]["content"], "Second system.");
    }

    #[test]
    fn system_prompt_skipped_without_messages() {
        let mut payload = body(json!({ "model": "custom", "messages": [] }));
        normalize(&mut payload, Some(&profile(json!({ "system": "S" }))), None);
        assert_eq!(payload["messages"], json!([]));
    }

    #[test]
    fn template_defaults_unknown_caller_fields() {
        let rendered = render_system_template(
            "{{USER_NAME}}/{{USER_LOCATION}} {{CURRENT_DATETIME}}",
            None,
            fixed_now(),
        );
        assert_eq!(rendered, "Unknown/Unknown 2024-05-17 02:03:09 PM");
    }

    #[test]
    fn legacy_vision_model_gets_default_max_tokens() {
        let mut payload = body(json!({ "model": LEGACY_VISION_MODEL }));
        normalize(&mut payload, None, None);
        assert_eq!(payload["max_tokens"], json!(4000));

        let mut explicit = body(json!({ "model": LEGACY_VISION_MODEL, "max_tokens": 12 }));
        normalize(&mut explicit, None, None);
        assert_eq!(explicit["max_tokens"], json!(12));

        let mut other = body(json!({ "model": "gpt-4o" }));
        normalize(&mut other, None, None);
        assert!(other.get("max_tokens").is_none());
    }

    #[test]
    fn alias_to_vision_model_triggers_workaround() {
        let mut payload = body(json!({ "model": "custom" }));
        let mut p = profile(Value::Null);
        p.base_model_id = Some(LEGACY_VISION_MODEL.to_string());
        normalize(&mut payload, Some(&p), None);
        assert_eq!(payload["max_tokens"], json!(4000));
    }
}
