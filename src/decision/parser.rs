use std::collections::HashMap;

use serde_json::Value;

use crate::domain::errors::ParseError;
use crate::domain::types::Decision;

/// JSON Schema published to the LLM client so structured output is constrained at the source.
pub fn decision_list_schema() -> Value {
    serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "required": ["symbol", "action", "confidence"],
            "properties": {
                "symbol": { "type": "string" },
                "action": {
                    "type": "string",
                    "enum": ["OPEN_LONG", "OPEN_SHORT", "CLOSE", "HOLD"]
                },
                "confidence": { "type": "integer", "minimum": 0, "maximum": 100 },
                "leverage": { "type": "integer", "minimum": 1 },
                "position_size_usd": { "type": "number", "minimum": 0 },
                "entry_price": { "type": "number" },
                "stop_loss": { "type": "number" },
                "take_profit": { "type": "number" },
                "risk_usd": { "type": "number" },
                "rationale": { "type": "string" }
            }
        }
    })
}

/// Enforces the `DecisionList` contract on raw assistant text.
pub struct DecisionParser;

impl DecisionParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses and validates assistant output into a deduplicated decision list.
    ///
    /// An empty array is treated as a single implicit `Hold` rather than an error, since a
    /// model choosing to do nothing is a valid outcome, not a malformed one.
    pub fn parse(&self, raw_text: &str) -> Result<Vec<Decision>, ParseError> {
        let trimmed = strip_code_fence(raw_text);
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ParseError::NotJson(e.to_string()))?;

        let items = value
            .as_array()
            .ok_or_else(|| ParseError::SchemaViolation("expected a JSON array".into()))?;

        if items.is_empty() {
            return Ok(vec![Decision {
                symbol: String::new(),
                action: crate::domain::types::DecisionAction::Hold,
                confidence: 0,
                leverage: None,
                position_size_usd: None,
                entry_price: None,
                stop_loss: None,
                take_profit: None,
                risk_usd: None,
                rationale: None,
            }]);
        }

        let mut ordered: Vec<Decision> = Vec::with_capacity(items.len());
        for item in items {
            let decision: Decision = serde_json::from_value(item.clone())
                .map_err(|e| ParseError::SchemaViolation(e.to_string()))?;
            if decision.confidence > 100 {
                return Err(ParseError::SchemaViolation(format!(
                    "confidence {} out of range",
                    decision.confidence
                )));
            }
            ordered.push(decision);
        }

        // Last-write-wins dedup by symbol, preserving first-seen ordering.
        let mut by_symbol: HashMap<String, Decision> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for decision in ordered {
            let key = decision.symbol.to_uppercase();
            if !by_symbol.contains_key(&key) {
                order.push(key.clone());
            }
            by_symbol.insert(key, decision);
        }

        Ok(order.into_iter().filter_map(|k| by_symbol.remove(&k)).collect())
    }
}

impl Default for DecisionParser {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim().strip_suffix("```").unwrap_or(rest).trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim().strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_decision_list() {
        let parser = DecisionParser::new();
        let raw = r#"[{"symbol":"BTC","action":"OPEN_LONG","confidence":85,"position_size_usd":500}]"#;
        let decisions = parser.parse(raw).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTC");
    }

    #[test]
    fn strips_markdown_code_fences() {
        let parser = DecisionParser::new();
        let raw = "```json\n[{\"symbol\":\"ETH\",\"action\":\"HOLD\",\"confidence\":50}]\n```";
        let decisions = parser.parse(raw).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "ETH");
    }

    #[test]
    fn empty_array_becomes_implicit_hold() {
        let parser = DecisionParser::new();
        let decisions = parser.parse("[]").unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(
            decisions[0].action,
            crate::domain::types::DecisionAction::Hold
        ));
    }

    #[test]
    fn rejects_non_json() {
        let parser = DecisionParser::new();
        assert!(parser.parse("not json at all").is_err());
    }

    #[test]
    fn dedupes_last_write_wins_by_symbol() {
        let parser = DecisionParser::new();
        let raw = r#"[
            {"symbol":"BTC","action":"OPEN_LONG","confidence":60},
            {"symbol":"BTC","action":"HOLD","confidence":90}
        ]"#;
        let decisions = parser.parse(raw).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].confidence, 90);
    }
}
