//! Environment-derived routes.
//!
//! Variables of the form `ROUTE_<NAME>=<pattern> <url> [description]` are
//! collected into a [`MatchingLocator`]. The URL scheme selects the TLS
//! mode: `https`/`wss` enable TLS, `http`/`ws` disable it. A missing port
//! defaults to 443 (TLS) or 80 (plain). The description defaults to the
//! upper-cased variable name. Anything invalid is a startup error.

use anyhow::{bail, Context, Result};
use url::Url;

use super::matching::MatchingLocator;
use super::name::Pattern;
use super::{Endpoint, TlsMode};

const ROUTE_PREFIX: &str = "ROUTE_";

/// Build a locator from `ROUTE_*` environment variables. Variables not
/// beginning with `ROUTE_` are ignored.
pub fn routes_from_env<I>(vars: I) -> Result<MatchingLocator>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut locator = MatchingLocator::new();

    for (key, value) in vars {
        let Some(route_name) = key.strip_prefix(ROUTE_PREFIX) else {
            continue;
        };

        let (pattern, endpoint) = parse_route(route_name, &value)
            .with_context(|| format!("invalid route {key}={value}"))?;
        locator.push(pattern, endpoint);
    }

    Ok(locator)
}

fn parse_route(route_name: &str, value: &str) -> Result<(Pattern, Endpoint)> {
    let mut parts = value.splitn(3, char::is_whitespace);
    let (Some(raw_pattern), Some(raw_url)) = (parts.next(), parts.next()) else {
        bail!("expected '<pattern> <url> [description]'");
    };

    let pattern = Pattern::parse(raw_pattern)
        .with_context(|| format!("invalid match pattern '{raw_pattern}'"))?;

    let url = Url::parse(raw_url).with_context(|| format!("invalid URL '{raw_url}'"))?;
    let tls_mode = match url.scheme() {
        "https" | "wss" => TlsMode::Enabled,
        "http" | "ws" => TlsMode::Disabled,
        other => bail!("unsupported URL scheme '{other}'"),
    };

    let host = url
        .host_str()
        .with_context(|| format!("URL '{raw_url}' has no host"))?;
    let port = url.port().unwrap_or(match tls_mode {
        TlsMode::Enabled => 443,
        _ => 80,
    });

    let description = match parts.next().map(str::trim).filter(|d| !d.is_empty()) {
        Some(description) => description.to_string(),
        None => route_name.to_uppercase(),
    };

    Ok((
        pattern,
        Endpoint::new(format!("{host}:{port}"), tls_mode, description),
    ))
}
