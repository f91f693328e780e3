use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::domain::errors::PromptError;
use crate::domain::ports::PromptRenderer;
use crate::domain::types::ExecutorContext;

/// Renders a trader's prompt template by substituting `{{key}}` placeholders with values
/// derived from the [`ExecutorContext`]. Templates are loaded fresh from disk on every render so
/// edits to a running trader's prompt take effect on the next cycle.
pub struct FilePromptRenderer {
    template_path: PathBuf,
}

impl FilePromptRenderer {
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
        }
    }

    fn substitute(template: &str, values: &HashMap<String, String>) -> Result<String, PromptError> {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                PromptError::TemplateError("unterminated placeholder".into())
            })?;
            let key = after[..end].trim();
            let value = values
                .get(key)
                .ok_or_else(|| PromptError::TemplateError(format!("missing template key: {key}")))?;
            rendered.push_str(value);
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }

    fn build_values(context: &ExecutorContext) -> HashMap<String, String> {
        let mut values = HashMap::new();
        values.insert("trader_id".into(), context.trader_id.clone());
        values.insert("timestamp".into(), context.timestamp.to_rfc3339());
        values.insert(
            "account_value_usd".into(),
            context.account_state.account_value_usd.to_string(),
        );
        values.insert(
            "available_balance_usd".into(),
            context.account_state.available_balance_usd.to_string(),
        );
        values.insert(
            "open_positions".into(),
            serde_json::to_string(&context.account_state.positions).unwrap_or_default(),
        );
        values.insert(
            "candidate_symbols".into(),
            context.candidate_symbols.join(", "),
        );
        values.insert(
            "market_snapshots".into(),
            serde_json::to_string(&context.snapshots).unwrap_or_default(),
        );
        values.insert("recent_cycles".into(), context.recent_cycles_digest.clone());
        values.insert(
            "min_confidence".into(),
            context.risk_summary.min_confidence.to_string(),
        );
        values.insert(
            "max_position_size_usd".into(),
            context.risk_summary.max_position_size_usd.to_string(),
        );
        values
    }
}

#[async_trait]
impl PromptRenderer for FilePromptRenderer {
    async fn render(&self, context: &ExecutorContext) -> Result<(String, String), PromptError> {
        let template = tokio::fs::read_to_string(&self.template_path)
            .await
            .map_err(|e| PromptError::TemplateError(format!("reading template: {e}")))?;
        let values = Self::build_values(context);
        let rendered = Self::substitute(&template, &values)?;
        let digest = hex::encode(Sha256::digest(rendered.as_bytes()));
        Ok((rendered, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let mut values = HashMap::new();
        values.insert("trader_id".to_string(), "alpha".to_string());
        let rendered = FilePromptRenderer::substitute("trader: {{trader_id}}", &values).unwrap();
        assert_eq!(rendered, "trader: alpha");
    }

    #[test]
    fn errors_on_missing_key() {
        let values = HashMap::new();
        let err = FilePromptRenderer::substitute("hello {{missing}}", &values);
        assert!(err.is_err());
    }

    #[test]
    fn errors_on_unterminated_placeholder() {
        let values = HashMap::new();
        let err = FilePromptRenderer::substitute("hello {{oops", &values);
        assert!(err.is_err());
    }
}
