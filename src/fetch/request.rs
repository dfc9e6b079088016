use std::collections::{BTreeMap, HashSet};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::Source;
use crate::error::{AppError, Context};

use super::FetchResult;

#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: HeaderMap,
}

/// Render the source's URL template, append unused params as query pairs, and build headers.
///
/// `${VAR}` placeholders in params and headers are expanded from the environment so that
/// credentials never need to live in the config files.
pub fn prepare_request(source: &Source) -> FetchResult<PreparedRequest> {
    let mut replacements: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in &source.params {
        replacements.insert(key.clone(), expand_env_vars(value)?);
    }

    let consumed: HashSet<String> = template_placeholders(&source.url_template)?
        .into_iter()
        .collect();
    let rendered = render_template(&source.url_template, &replacements)?;

    let extra: Vec<(&String, &String)> = replacements
        .iter()
        .filter(|(key, _)| !consumed.contains(*key))
        .collect();

    let url = if extra.is_empty() {
        rendered
    } else {
        reqwest::Url::parse_with_params(&rendered, extra)
            .with_context(|| format!("Invalid URL rendered for source {}", source.name))?
            .to_string()
    };

    let headers = build_headers(&source.headers)?;
    Ok(PreparedRequest { url, headers })
}

pub fn expand_env_vars(value: &str) -> FetchResult<String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            while let Some(&next) = chars.peek() {
                chars.next();
                if next == '}' {
                    closed = true;
                    break;
                }
                name.push(next);
            }

            if name.is_empty() {
                return Err(AppError::Config(
                    "Encountered empty environment placeholder".to_string(),
                ));
            }

            if !closed {
                return Err(AppError::Config(
                    "Unterminated environment placeholder".to_string(),
                ));
            }

            let value = std::env::var(&name).with_context(|| {
                format!("Environment variable {name} required by source config is not set")
            })?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

/// Names of the `{placeholder}` segments in a URL template, in order of appearance.
pub fn template_placeholders(template: &str) -> FetchResult<Vec<String>> {
    let mut names = Vec::new();
    scan_template(template, |piece| {
        if let TemplatePiece::Placeholder(name) = piece {
            names.push(name.to_string());
        }
        Ok(())
    })?;
    Ok(names)
}

fn render_template(template: &str, replacements: &BTreeMap<String, String>) -> FetchResult<String> {
    let mut result = String::with_capacity(template.len());
    scan_template(template, |piece| {
        match piece {
            TemplatePiece::Literal(ch) => result.push(ch),
            TemplatePiece::Placeholder(key) => {
                let value = replacements.get(key).ok_or_else(|| {
                    AppError::Config(format!(
                        "No replacement provided for placeholder `{key}` in template"
                    ))
                })?;
                result.push_str(value);
            }
        }
        Ok(())
    })?;
    Ok(result)
}

enum TemplatePiece<'a> {
    Literal(char),
    Placeholder(&'a str),
}

fn scan_template<'a, F>(template: &'a str, mut visit: F) -> FetchResult<()>
where
    F: FnMut(TemplatePiece<'a>) -> FetchResult<()>,
{
    let mut rest = template;
    while let Some(ch) = rest.chars().next() {
        if ch == '{' {
            let Some(end) = rest.find('}') else {
                return Err(AppError::Config(format!(
                    "Unterminated placeholder in template: {rest}"
                )));
            };
            let key = &rest[1..end];
            if key.is_empty() {
                return Err(AppError::Config(
                    "Encountered empty placeholder `{}` in template".to_string(),
                ));
            }
            visit(TemplatePiece::Placeholder(key))?;
            rest = &rest[end + 1..];
        } else {
            visit(TemplatePiece::Literal(ch))?;
            rest = &rest[ch.len_utf8()..];
        }
    }
    Ok(())
}

fn build_headers(headers: &BTreeMap<String, String>) -> FetchResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("Invalid header name: {key}"))?;
        let expanded = expand_env_vars(value)?;
        let header_value = HeaderValue::from_str(&expanded)
            .with_context(|| format!("Invalid header value for {key}"))?;
        map.insert(name, header_value);
    }
    Ok(map)
}
