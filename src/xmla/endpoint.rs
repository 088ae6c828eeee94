//! XMLA endpoint parsing.
//!
//! Accepted forms:
//!
//! - `powerbi://api.powerbi.com/v1.0/myorg/<workspace>`
//! - `asazure://<region>.asazure.windows.net/<server>`
//! - `https://...` (used as-is)
//! - a connection string such as `Data Source=powerbi://...;Initial Catalog=Sales`

use crate::constants::{ASAZURE_SCOPE, POWERBI_SCOPE};
use crate::error::ServerError;
use url::Url;

/// Which service an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    PowerBi,
    AzureAnalysisServices,
    Https,
}

/// A parsed, HTTPS-addressable XMLA endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlaEndpoint {
    kind: EndpointKind,
    url: Url,
    catalog_hint: Option<String>,
}

impl XmlaEndpoint {
    /// Parse an endpoint or connection string.
    pub fn parse(input: &str) -> Result<Self, ServerError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ServerError::validation("endpoint must not be empty"));
        }

        if looks_like_connection_string(input) {
            return Self::parse_connection_string(input);
        }

        Self::parse_url(input)
    }

    fn parse_connection_string(input: &str) -> Result<Self, ServerError> {
        let mut source = None;
        let mut catalog = None;

        for pair in input.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "data source" | "datasource" | "server" | "location" => {
                    source = Some(value.to_string())
                }
                "initial catalog" | "catalog" | "database" if !value.is_empty() => {
                    catalog = Some(value.to_string())
                }
                _ => {}
            }
        }

        let source = source
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::validation("connection string has no Data Source"))?;

        let mut endpoint = Self::parse_url(&source)?;
        endpoint.catalog_hint = catalog;
        Ok(endpoint)
    }

    fn parse_url(input: &str) -> Result<Self, ServerError> {
        let parsed = Url::parse(input).map_err(|e| {
            ServerError::validation(format!("endpoint '{}' is not a valid URL: {}", input, e))
        })?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ServerError::validation(format!("endpoint '{}' has no host", input)))?
            .to_string();

        let has_path = parsed
            .path_segments()
            .map(|mut segments| segments.any(|s| !s.is_empty()))
            .unwrap_or(false);

        let (kind, url) = match parsed.scheme() {
            "powerbi" => {
                if !has_path {
                    return Err(ServerError::validation(
                        "Power BI endpoint must name a workspace, e.g. powerbi://api.powerbi.com/v1.0/myorg/Sales",
                    ));
                }
                let rewritten = format!("https://{}{}", host, parsed.path());
                (EndpointKind::PowerBi, parse_https(&rewritten)?)
            }
            "asazure" => {
                if !has_path {
                    return Err(ServerError::validation(
                        "Analysis Services endpoint must name a server, e.g. asazure://westus.asazure.windows.net/myserver",
                    ));
                }
                let rewritten = format!("https://{}/webapi/xmla", host);
                (EndpointKind::AzureAnalysisServices, parse_https(&rewritten)?)
            }
            "https" => {
                let kind = if host.ends_with(".asazure.windows.net") {
                    EndpointKind::AzureAnalysisServices
                } else if host.ends_with(".powerbi.com") {
                    EndpointKind::PowerBi
                } else {
                    EndpointKind::Https
                };
                (kind, parsed)
            }
            other => {
                return Err(ServerError::validation(format!(
                    "unsupported endpoint scheme '{}': use powerbi://, asazure:// or https://",
                    other
                )))
            }
        };

        Ok(Self {
            kind,
            url,
            catalog_hint: None,
        })
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// The HTTPS URL that receives SOAP requests.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Catalog named inside a connection string, if any.
    pub fn catalog_hint(&self) -> Option<&str> {
        self.catalog_hint.as_deref()
    }

    /// OAuth scope for bearer tokens presented to this endpoint.
    pub fn token_scope(&self) -> &'static str {
        match self.kind {
            EndpointKind::AzureAnalysisServices => ASAZURE_SCOPE,
            EndpointKind::PowerBi | EndpointKind::Https => POWERBI_SCOPE,
        }
    }
}

impl std::str::FromStr for XmlaEndpoint {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn looks_like_connection_string(input: &str) -> bool {
    match (input.find('='), input.find("://")) {
        (Some(eq), Some(scheme)) => eq < scheme,
        (Some(_), None) => true,
        _ => false,
    }
}

fn parse_https(input: &str) -> Result<Url, ServerError> {
    Url::parse(input)
        .map_err(|e| ServerError::validation(format!("endpoint '{}' is invalid: {}", input, e)))
}
