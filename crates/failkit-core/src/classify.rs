//! Host classification.
//!
//! Maps a destination hostname to a `(tool_name, tool_category)` pair using an
//! ordered table of substring patterns. The first matching pattern wins; hosts
//! that match nothing fall back to their first label with category `http`.
//! Classification is total: every input, including empty strings and garbage,
//! yields a non-empty name and category.

use serde::{Deserialize, Serialize};

/// Category for hosts that match no known service.
pub const FALLBACK_CATEGORY: &str = "http";

/// Tool name used when nothing usable can be taken from the host.
pub const UNKNOWN_TOOL: &str = "unknown";

/// Result of classifying a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolClass {
    pub tool_name: String,
    pub tool_category: String,
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct ServicePattern {
    /// Substring matched against the lower-cased host.
    pub pattern: &'static str,
    pub tool_name: &'static str,
    pub tool_category: &'static str,
}

const fn service(
    pattern: &'static str,
    tool_name: &'static str,
    tool_category: &'static str,
) -> ServicePattern {
    ServicePattern {
        pattern,
        tool_name,
        tool_category,
    }
}

/// Known services, most specific patterns first.
pub const KNOWN_SERVICES: &[ServicePattern] = &[
    // Model APIs
    service("openai", "openai", "llm"),
    service("anthropic", "anthropic", "llm"),
    service("generativelanguage.googleapis", "gemini", "llm"),
    service("aiplatform.googleapis", "vertex_ai", "llm"),
    service("openrouter", "openrouter", "llm"),
    service("mistral", "mistral", "llm"),
    service("cohere", "cohere", "llm"),
    service("groq", "groq", "llm"),
    service("together", "together", "llm"),
    service("perplexity", "perplexity", "llm"),
    service("api.x.ai", "xai", "llm"),
    service("huggingface", "huggingface", "llm"),
    service("bedrock-runtime", "bedrock", "llm"),
    // Payments
    service("stripe", "stripe", "payment"),
    service("paypal", "paypal", "payment"),
    service("braintree", "braintree", "payment"),
    service("squareup", "square", "payment"),
    service("adyen", "adyen", "payment"),
    // Email
    service("sendgrid", "sendgrid", "email"),
    service("mailgun", "mailgun", "email"),
    service("postmark", "postmark", "email"),
    service("resend", "resend", "email"),
    service("mandrill", "mandrill", "email"),
    service("mailchimp", "mailchimp", "email"),
    service("email.", "ses", "email"),
    // Storage
    service("s3.", "s3", "storage"),
    service(".s3-", "s3", "storage"),
    service("storage.googleapis", "gcs", "storage"),
    service("blob.core.windows", "azure_blob", "storage"),
    service("r2.cloudflarestorage", "r2", "storage"),
    service("supabase", "supabase", "storage"),
    // Messaging
    service("slack", "slack", "messaging"),
    service("twilio", "twilio", "messaging"),
    service("discord", "discord", "messaging"),
];

/// Classifies a hostname. Ports, surrounding whitespace and case are ignored.
///
/// ```
/// use failkit_core::classify_host;
///
/// let class = classify_host("api.openai.com");
/// assert_eq!(class.tool_category, "llm");
///
/// let class = classify_host("internal.example.org");
/// assert_eq!(class.tool_name, "internal");
/// assert_eq!(class.tool_category, "http");
/// ```
pub fn classify_host(host: &str) -> ToolClass {
    let host = normalize_host(host);

    if !host.is_empty() {
        if let Some(known) = KNOWN_SERVICES.iter().find(|s| host.contains(s.pattern)) {
            return ToolClass {
                tool_name: known.tool_name.to_string(),
                tool_category: known.tool_category.to_string(),
            };
        }
    }

    ToolClass {
        tool_name: fallback_name(&host),
        tool_category: FALLBACK_CATEGORY.to_string(),
    }
}

/// Lower-cases a host and strips any port and IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_lowercase();

    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080
        return rest.split(']').next().unwrap_or_default().to_string();
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host,
    }
}

fn fallback_name(host: &str) -> String {
    let label: String = host
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if label.is_empty() {
        UNKNOWN_TOOL.to_string()
    } else {
        label
    }
}
