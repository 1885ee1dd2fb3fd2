use std::collections::HashMap;

/// Defaults for a named OpenAI-compatible endpoint.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

/// Look up a provider preset by name. `openai` itself has no preset.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    let (url, needs_api_key, extra_headers): (_, _, &'static [(&str, &str)]) = match provider {
        "ollama" => ("http://localhost:11434/v1/chat/completions", false, &[]),
        "groq" => ("https://api.groq.com/openai/v1/chat/completions", true, &[]),
        "openrouter" => (
            "https://openrouter.ai/api/v1/chat/completions",
            true,
            &[("X-Title", "Forage")],
        ),
        "together" => ("https://api.together.xyz/v1/chat/completions", true, &[]),
        "mistral" => ("https://api.mistral.ai/v1/chat/completions", true, &[]),
        "deepseek" => ("https://api.deepseek.com/v1/chat/completions", true, &[]),
        _ => return None,
    };
    Some(ProviderPreset {
        default_base_url: url,
        needs_api_key,
        extra_headers,
    })
}

/// Build extra headers from a preset + user config overrides.
pub fn build_extra_headers(
    preset: &ProviderPreset,
    user_headers: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = preset
        .extra_headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for (k, v) in user_headers {
        // User overrides take precedence
        if let Some(pos) = headers.iter().position(|(hk, _)| hk == k) {
            headers[pos].1 = v.clone();
        } else {
            headers.push((k.clone(), v.clone()));
        }
    }

    headers
}

/// Whether the provider speaks the OpenAI chat-completions protocol.
pub fn is_openai_compatible(provider: &str) -> bool {
    provider == "openai" || get_preset(provider).is_some()
}

/// Whether requests to this provider need an API key.
pub fn needs_api_key(provider: &str) -> bool {
    get_preset(provider).map(|p| p.needs_api_key).unwrap_or(true)
}
