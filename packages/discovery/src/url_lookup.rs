//! Official website lookup.
//!
//! Asks the chat model for the fair's official URL and checks that the host
//! actually resolves before trusting it. A rejected URL is fed back into the
//! next attempt so the model does not repeat the same guess.

use serde::Deserialize;
use url::Url;

use crate::classifier::parse_json_response;
use crate::error::DiscoveryError;
use crate::traits::ChatModel;
use crate::types::DiscoveryRequest;

const LOOKUP_SYSTEM: &str = "You look up official trade fair websites. \
Answer with a single JSON object and nothing else.";

#[derive(Debug, Deserialize)]
struct LookupReply {
    url: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

fn lookup_prompt(request: &DiscoveryRequest, failed_url: Option<&str>) -> String {
    let failed_note = match failed_url {
        Some(url) => format!(
            "\nIMPORTANT: the previously suggested URL \"{url}\" did not resolve. \
Double-check the domain spelling.\n"
        ),
        None => String::new(),
    };
    let city = if request.fair_city.is_empty() {
        String::new()
    } else {
        format!("\nCity: {}", request.fair_city)
    };
    format!(
        r#"Find the official website URL for this trade fair:{failed_note}
Trade fair: {name}
Year: {year}{city}

Return ONLY a JSON object with: url, confidence ("high"/"medium"/"low"), notes.
If not found: {{"url": null, "confidence": "low", "notes": "..."}}"#,
        name = request.fair_name,
        year = request.fair_year,
    )
}

async fn host_resolves(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    tokio::net::lookup_host((host, 443))
        .await
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Resolve the fair's official URL.
///
/// A caller-supplied known URL wins without any model call. Otherwise up to
/// `attempts` model queries are made; each candidate must pass a DNS check.
pub async fn resolve_fair_url<M: ChatModel>(
    model: &M,
    request: &DiscoveryRequest,
    attempts: u32,
) -> Result<Url, DiscoveryError> {
    if let Some(known) = &request.known_url {
        tracing::info!(url = %known, "using caller-supplied fair url");
        return Ok(known.clone());
    }

    let mut failed_url: Option<String> = None;
    for attempt in 1..=attempts {
        let prompt = lookup_prompt(request, failed_url.as_deref());
        let reply = model
            .complete(LOOKUP_SYSTEM, &prompt)
            .await
            .map_err(|e| DiscoveryError::UrlResolution(format!("model call failed: {e}")))?;

        let parsed: LookupReply = parse_json_response(&reply).ok_or_else(|| {
            DiscoveryError::UrlResolution("unparseable url lookup reply".to_string())
        })?;

        let Some(candidate) = parsed.url else {
            return Err(DiscoveryError::UrlResolution(format!(
                "no official website found: {}",
                parsed.notes.unwrap_or_default()
            )));
        };

        let url = Url::parse(&candidate).map_err(|e| {
            DiscoveryError::UrlResolution(format!("model returned invalid url '{candidate}': {e}"))
        })?;

        if host_resolves(&url).await {
            tracing::info!(
                url = %url,
                confidence = parsed.confidence.as_deref().unwrap_or("?"),
                attempt,
                "fair url resolved"
            );
            return Ok(url);
        }
        tracing::warn!(url = %url, attempt, "suggested url does not resolve, retrying");
        failed_url = Some(candidate);
    }

    Err(DiscoveryError::UrlResolution(format!(
        "no resolvable url after {attempts} attempts (last: {})",
        failed_url.unwrap_or_default()
    )))
}
