// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Download events carried in the syslog message body.
//!
//! Two pipe-delimited layouts are understood:
//!
//! ```text
//! download|TIMESTAMP|COUNTRY|URL|TLS_PROTOCOL|TLS_CIPHER|PROJECT|VERSION|PACKAGE_TYPE|USER_AGENT
//! 2@TIMESTAMP|COUNTRY|URL|TLS_PROTOCOL|TLS_CIPHER|USER_AGENT
//! ```
//!
//! The second layout omits file metadata, which is recovered from the file name in the URL.
//! Empty fields become `None`. The user agent is always last and may itself contain pipes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::errors::EventParseError;

const V1_PREFIX: &str = "download|";
const V2_PREFIX: &str = "2@";
const V1_FIELDS: usize = 9;
const V2_FIELDS: usize = 6;
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A single file download served by the CDN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Download {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub file: File,
    pub tls_protocol: Option<String>,
    pub tls_cipher: Option<String>,
    pub country_code: Option<String>,
    pub details: Option<UserAgent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct File {
    pub filename: String,
    pub project: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserAgent {
    pub installer: Option<Installer>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installer {
    pub name: String,
    pub version: Option<String>,
}

/// Parses a syslog message body into a [`Download`].
pub fn parse(message: &str) -> Result<Download, EventParseError> {
    if let Some(rest) = message.strip_prefix(V1_PREFIX) {
        parse_v1(rest)
    } else if let Some(rest) = message.strip_prefix(V2_PREFIX) {
        parse_v2(rest)
    } else {
        Err(EventParseError::UnknownFormat)
    }
}

fn split_fields(body: &str, expected: usize) -> Result<Vec<&str>, EventParseError> {
    let fields: Vec<&str> = body.splitn(expected, '|').collect();
    if fields.len() != expected {
        return Err(EventParseError::FieldCount {
            expected,
            actual: fields.len(),
        });
    }
    Ok(fields)
}

fn parse_v1(body: &str) -> Result<Download, EventParseError> {
    let f = split_fields(body, V1_FIELDS)?;
    let url = required(f[2], "url")?;
    Ok(Download {
        timestamp: parse_timestamp(f[0])?,
        file: File {
            filename: filename_from_url(&url).to_string(),
            project: optional(f[5]),
            version: optional(f[6]),
            type_: optional(f[7]),
        },
        url,
        tls_protocol: optional(f[3]),
        tls_cipher: optional(f[4]),
        country_code: optional(f[1]),
        details: parse_user_agent(f[8]),
    })
}

fn parse_v2(body: &str) -> Result<Download, EventParseError> {
    let f = split_fields(body, V2_FIELDS)?;
    let url = required(f[2], "url")?;
    Ok(Download {
        timestamp: parse_timestamp(f[0])?,
        file: file_from_filename(filename_from_url(&url)),
        url,
        tls_protocol: optional(f[3]),
        tls_cipher: optional(f[4]),
        country_code: optional(f[1]),
        details: parse_user_agent(f[5]),
    })
}

fn optional(field: &str) -> Option<String> {
    let field = field.trim();
    (!field.is_empty()).then(|| field.to_string())
}

fn required(field: &str, name: &'static str) -> Result<String, EventParseError> {
    optional(field).ok_or(EventParseError::MissingField(name))
}

fn parse_timestamp(field: &str) -> Result<DateTime<Utc>, EventParseError> {
    let field = field.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(field) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(field, HTTP_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| EventParseError::Timestamp(field.to_string()))
}

fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

/// Recovers project, version and distribution type from a distribution file name.
fn file_from_filename(filename: &str) -> File {
    let mut file = File {
        filename: filename.to_string(),
        ..File::default()
    };

    if let Some(stem) = filename.strip_suffix(".whl") {
        // name-version(-build)?-python-abi-platform.whl
        let mut parts = stem.split('-');
        file.project = parts.next().map(|p| p.replace('_', "-"));
        file.version = parts.next().map(str::to_string);
        file.type_ = Some("bdist_wheel".to_string());
    } else if let Some(stem) = filename.strip_suffix(".egg") {
        let mut parts = stem.split('-');
        file.project = parts.next().map(|p| p.replace('_', "-"));
        file.version = parts.next().map(str::to_string);
        file.type_ = Some("bdist_egg".to_string());
    } else if let Some(stem) = [".tar.gz", ".tar.bz2", ".tgz", ".zip"]
        .iter()
        .find_map(|ext| filename.strip_suffix(ext))
    {
        if let Some((project, version)) = stem.rsplit_once('-') {
            file.project = Some(project.to_string());
            file.version = Some(version.to_string());
        }
        file.type_ = Some("sdist".to_string());
    }

    file
}

fn parse_user_agent(field: &str) -> Option<UserAgent> {
    let raw = optional(field)?;
    let installer = raw
        .split_whitespace()
        .next()
        .and_then(|token| token.split_once('/'))
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, version)| Installer {
            name: name.to_string(),
            version: (!version.is_empty()).then(|| version.to_string()),
        });
    Some(UserAgent { installer, raw })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_v1() {
        let event = parse(
            "download|2018-07-20T02:19:20Z|US|/packages/ab/cd/requests-2.19.1-py2.py3-none-any.whl|TLSv1.2|ECDHE-RSA-AES128-GCM-SHA256|requests|2.19.1|bdist_wheel|pip/18.0 {\"python\":\"3.7.0\"}",
        )
        .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2018, 7, 20, 2, 19, 20).unwrap()
        );
        assert_eq!(event.country_code.as_deref(), Some("US"));
        assert_eq!(event.file.filename, "requests-2.19.1-py2.py3-none-any.whl");
        assert_eq!(event.file.project.as_deref(), Some("requests"));
        assert_eq!(event.file.version.as_deref(), Some("2.19.1"));
        assert_eq!(event.file.type_.as_deref(), Some("bdist_wheel"));
        assert_eq!(event.tls_protocol.as_deref(), Some("TLSv1.2"));
        let details = event.details.unwrap();
        let installer = details.installer.unwrap();
        assert_eq!(installer.name, "pip");
        assert_eq!(installer.version.as_deref(), Some("18.0"));
    }

    #[test]
    fn test_parse_v2_derives_file_metadata() {
        let event = parse(
            "2@Fri, 20 Jul 2018 02:19:20 GMT||/packages/source/s/six/six-1.11.0.tar.gz|||bandersnatch/3.0",
        )
        .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2018, 7, 20, 2, 19, 20).unwrap()
        );
        assert_eq!(event.country_code, None);
        assert_eq!(event.tls_protocol, None);
        assert_eq!(event.file.project.as_deref(), Some("six"));
        assert_eq!(event.file.version.as_deref(), Some("1.11.0"));
        assert_eq!(event.file.type_.as_deref(), Some("sdist"));
    }

    #[test]
    fn test_user_agent_may_contain_pipes() {
        let event =
            parse("2@2018-07-20T02:19:20Z|US|/f/x-1.0.zip|||curl/7.0 a|b").unwrap();
        assert_eq!(event.details.unwrap().raw, "curl/7.0 a|b");
    }

    #[test]
    fn test_user_agent_without_installer() {
        let event = parse("2@2018-07-20T02:19:20Z|US|/f/x-1.0.zip|||Mozilla").unwrap();
        let details = event.details.unwrap();
        assert_eq!(details.installer, None);
        assert_eq!(details.raw, "Mozilla");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("upload|x"), Err(EventParseError::UnknownFormat));
        assert_eq!(
            parse("2@2018-07-20T02:19:20Z|US"),
            Err(EventParseError::FieldCount {
                expected: 6,
                actual: 2
            })
        );
        assert!(matches!(
            parse("2@yesterday|US|/f/x-1.0.zip|||pip/1"),
            Err(EventParseError::Timestamp(_))
        ));
        assert_eq!(
            parse("2@2018-07-20T02:19:20Z|US||||pip/1"),
            Err(EventParseError::MissingField("url"))
        );
    }
}
