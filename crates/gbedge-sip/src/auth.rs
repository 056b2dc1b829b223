// SIP 摘要鉴权（RFC 2617, MD5）
// GB28181 平台通常不带 qop，这里同时兼容 qop=auth

use rand::Rng;

/// 平台 401/407 下发的摘要挑战。
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

/// 解析 WWW-Authenticate / Proxy-Authenticate 头。
pub fn parse_challenge(header_value: &str) -> Option<DigestChallenge> {
    let trimmed = header_value.trim();
    if !trimmed.to_ascii_lowercase().starts_with("digest ") {
        return None;
    }
    let params = trimmed[6..].trim_start();

    let mut realm = None;
    let mut nonce = None;
    let mut algorithm = None;
    let mut qop = None;
    let mut opaque = None;

    for part in split_params(params) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().trim_matches('"').to_string();
        match key.as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "algorithm" => algorithm = Some(value),
            "qop" => qop = Some(value),
            "opaque" => opaque = Some(value),
            _ => {}
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        algorithm,
        qop,
        opaque,
    })
}

/// 由挑战与凭据生成 Authorization 头的值（含 `Digest ` 前缀）。
/// 挑战指定了 MD5 以外的算法时返回 None。
pub fn build_authorization(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    nc: u32,
) -> Option<String> {
    build_authorization_with_cnonce(username, password, method, uri, challenge, nc, None)
}

fn build_authorization_with_cnonce(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    nc: u32,
    cnonce_override: Option<&str>,
) -> Option<String> {
    if let Some(algorithm) = challenge.algorithm.as_deref() {
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return None;
        }
    }

    let qop = challenge.qop.as_deref().and_then(select_qop);
    let cnonce = qop.map(|_| {
        cnonce_override
            .map(|v| v.to_string())
            .unwrap_or_else(|| format!("{:x}", rand::thread_rng().gen::<u64>()))
    });

    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let response = match qop {
        Some(qop_value) => {
            let cnonce_value = cnonce.as_deref()?;
            md5_hex(&format!(
                "{}:{}:{:08x}:{}:{}:{}",
                ha1, challenge.nonce, nc, cnonce_value, qop_value, ha2
            ))
        }
        None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    };

    let mut params = vec![
        format!("username=\"{username}\""),
        format!("realm=\"{}\"", challenge.realm),
        format!("nonce=\"{}\"", challenge.nonce),
        format!("uri=\"{uri}\""),
        format!("response=\"{response}\""),
    ];
    if let Some(opaque) = challenge.opaque.as_deref() {
        params.push(format!("opaque=\"{opaque}\""));
    }
    if let Some(algorithm) = challenge.algorithm.as_deref() {
        params.push(format!("algorithm={algorithm}"));
    }
    if let Some(qop_value) = qop {
        params.push(format!("qop={qop_value}"));
        params.push(format!("nc={nc:08x}"));
        params.push(format!("cnonce=\"{}\"", cnonce.unwrap_or_default()));
    }

    Some(format!("Digest {}", params.join(", ")))
}

fn select_qop(raw: &str) -> Option<&'static str> {
    raw.split(',')
        .map(|token| token.trim())
        .find(|token| token.eq_ignore_ascii_case("auth"))
        .map(|_| "auth")
}

/// 逗号分参数，引号内的逗号不算分隔符。
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, ch) in input.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        }
        if ch == ',' && !in_quotes {
            parts.push(input[start..idx].trim());
            start = idx + 1;
        }
    }
    if start < input.len() {
        parts.push(input[start..].trim());
    }
    parts
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
