//! Translate public-schema requests into native requests.
//!
//! One pure function per endpoint. Translators validate option ranges up
//! front and never call the native handler; the caller does that with the
//! rewritten request. Public fields with no native counterpart are dropped.

use super::content::to_native_message;
use super::native_types::{
    NativeChatRequest, NativeGenerateRequest, NativeOptions, NativeShowRequest,
};
use super::openai_types::{
    ChatCompletionRequest, CompletionRequest, ResponseFormatType, SamplingOptions,
};
use crate::config::TranslationConfig;
use crate::error::{Result, ShimError};

/// Translate a chat completion request into a native chat request.
pub fn chat_to_native(
    req: &ChatCompletionRequest,
    settings: &TranslationConfig,
) -> Result<NativeChatRequest> {
    require_model(&req.model)?;

    let messages = req
        .messages
        .iter()
        .map(to_native_message)
        .collect::<Result<Vec<_>>>()?;

    let format = req
        .response_format
        .as_ref()
        .filter(|f| f.format_type == ResponseFormatType::JsonObject)
        .map(|_| "json".to_string());

    Ok(NativeChatRequest {
        model: req.model.clone(),
        messages,
        stream: req.stream,
        format,
        options: native_options(&req.options, settings)?,
    })
}

/// Translate a text completion request into a native generate request.
pub fn completion_to_native(
    req: &CompletionRequest,
    settings: &TranslationConfig,
) -> Result<NativeGenerateRequest> {
    require_model(&req.model)?;

    Ok(NativeGenerateRequest {
        model: req.model.clone(),
        prompt: req.prompt.clone(),
        suffix: req.suffix.clone(),
        stream: req.stream,
        options: native_options(&req.options, settings)?,
    })
}

/// Build the native lookup for a single model. The name comes from the URL path.
pub fn retrieve_to_native(model: &str) -> Result<NativeShowRequest> {
    let model = model.trim_matches('/');
    require_model(model)?;
    Ok(NativeShowRequest {
        model: model.to_string(),
    })
}

fn require_model(model: &str) -> Result<()> {
    if model.trim().is_empty() {
        return Err(ShimError::malformed_request("'model' must not be empty"));
    }
    Ok(())
}

/// Rename sampling options to their native names, rejecting out-of-range values.
fn native_options(opts: &SamplingOptions, settings: &TranslationConfig) -> Result<NativeOptions> {
    check_range("temperature", opts.temperature, 0.0, 2.0)?;
    check_range("top_p", opts.top_p, 0.0, 1.0)?;
    check_range("frequency_penalty", opts.frequency_penalty, -2.0, 2.0)?;
    check_range("presence_penalty", opts.presence_penalty, -2.0, 2.0)?;

    if opts.max_tokens == Some(0) {
        return Err(ShimError::malformed_request(
            "'max_tokens' must be at least 1",
        ));
    }
    if let Some(n) = opts.n {
        if n != 1 {
            return Err(ShimError::malformed_request(format!(
                "'n' must be 1, got {n}; only a single choice is supported"
            )));
        }
    }

    Ok(NativeOptions {
        temperature: opts.temperature.map(|t| t * settings.temperature_scale),
        top_p: opts.top_p,
        num_predict: opts.max_tokens,
        stop: opts.stop.clone().map(|s| s.into_vec()),
        seed: opts.seed,
        frequency_penalty: opts.frequency_penalty,
        presence_penalty: opts.presence_penalty,
    })
}

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(ShimError::malformed_request(format!(
            "'{name}' must be between {min} and {max}, got {v}"
        ))),
        _ => Ok(()),
    }
}
