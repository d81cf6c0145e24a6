use axum::http::HeaderMap;

use crate::types::VisitorMetadata;

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| header_text(headers, name))
}

/// Edge proxies percent-encode non-ASCII place names.
fn decoded(value: Option<String>) -> Option<String> {
    value.map(|raw| {
        urlencoding::decode(&raw)
            .map(|text| text.into_owned())
            .unwrap_or(raw)
    })
}

pub fn build_visitor_metadata(headers: &HeaderMap) -> VisitorMetadata {
    let ip = header_text(headers, "x-forwarded-for")
        .and_then(|chain| {
            chain
                .split(',')
                .map(str::trim)
                .find(|hop| !hop.is_empty())
                .map(str::to_string)
        })
        .or_else(|| header_text(headers, "x-real-ip"));

    VisitorMetadata {
        ip,
        country: first_header(headers, &["x-vercel-ip-country", "cf-ipcountry"]),
        region: decoded(first_header(
            headers,
            &["x-vercel-ip-country-region", "cf-region"],
        )),
        city: decoded(first_header(headers, &["x-vercel-ip-city", "cf-ipcity"])),
        referrer: header_text(headers, "referer"),
        user_agent: header_text(headers, "user-agent"),
    }
}
