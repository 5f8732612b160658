use serde_json::Value;

// Token counts recovered from a response body after the fact. Absent fields
// stay None; accounting is strictly best-effort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUsage {
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

// Per-MTok pricing for cost estimates, matched by model id substring.
const PRICING: [(&str, f64, f64); 3] = [
    ("opus", 15.0, 75.0),
    ("sonnet", 3.0, 15.0),
    ("haiku", 0.80, 4.0),
];

pub fn estimate_cost(model: &str, input_tokens: i64, output_tokens: i64) -> Option<f64> {
    let (_, input_price, output_price) = PRICING
        .iter()
        .find(|(needle, _, _)| model.contains(needle))?;
    Some(
        (input_tokens as f64 * input_price + output_tokens as f64 * output_price) / 1_000_000.0,
    )
}

// Extracts usage from a buffered JSON message response.
pub fn parse_json_usage(body: &[u8]) -> TokenUsage {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return TokenUsage::default();
    };
    let usage = value.get("usage");
    TokenUsage {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
        input_tokens: usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_i64),
        output_tokens: usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_i64),
    }
}

// Extracts usage from a captured SSE prefix. `message_start` carries the
// model and input token count, later `message_delta` events carry the
// cumulative output token count.
pub fn parse_sse_usage(buffer: &[u8]) -> TokenUsage {
    let text = String::from_utf8_lossy(buffer);
    let mut usage = TokenUsage::default();

    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(payload.trim()) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message = event.get("message");
                usage.model = message
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                usage.input_tokens = message
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_i64);
            }
            Some("message_delta") => {
                if let Some(output) = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64)
                {
                    usage.output_tokens = Some(output);
                }
            }
            _ => {}
        }
    }

    usage
}

pub fn cost_for(usage: &TokenUsage) -> Option<f64> {
    match (&usage.model, usage.input_tokens, usage.output_tokens) {
        (Some(model), Some(input), Some(output)) => estimate_cost(model, input, output),
        _ => None,
    }
}
