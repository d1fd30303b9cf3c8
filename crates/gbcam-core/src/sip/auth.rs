// GB28181 Digest 鉴权（RFC 2617，不使用 qop）
// 设备侧：解析平台下发的挑战并计算 Authorization 应答

use crate::{GbError, Result};
use std::collections::HashMap;

/// 平台下发的 Digest 挑战
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
}

impl DigestChallenge {
    /// 从 WWW-Authenticate / Proxy-Authenticate 头部解析挑战
    pub fn parse(header_value: &str) -> Result<Self> {
        let params = parse_digest_params(header_value)
            .ok_or_else(|| GbError::Auth(format!("bad digest header: {:?}", header_value)))?;

        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| GbError::Auth("challenge missing realm".to_string()))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| GbError::Auth("challenge missing nonce".to_string()))?;
        let algorithm = params
            .get("algorithm")
            .cloned()
            .unwrap_or_else(|| "MD5".to_string());

        Ok(Self {
            realm,
            nonce,
            algorithm,
        })
    }

    /// 生成 Authorization 头部值
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let response =
            compute_digest_response(username, &self.realm, password, method, uri, &self.nonce);

        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri, response
        )
    }
}

/// 解析 Digest 头部为键值对
pub fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.strip_prefix("Digest ").unwrap_or(value);

    let mut map = HashMap::new();

    for part in rest.split(',') {
        let trimmed = part.trim();
        if let Some(eq_idx) = trimmed.find('=') {
            let key = trimmed[..eq_idx].trim().to_string();
            let mut val = trimmed[eq_idx + 1..].trim().to_string();
            if val.starts_with('"') && val.ends_with('"') && val.len() >= 2 {
                val = val[1..val.len() - 1].to_string();
            }
            map.insert(key, val);
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// 计算 Digest 响应值
///
/// HA1 = MD5(username:realm:password)
/// HA2 = MD5(method:uri)
/// response = MD5(HA1:nonce:HA2)
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1_source = format!("{}:{}:{}", username, realm, password);
    let ha1 = format!("{:x}", md5::compute(ha1_source));

    let ha2_source = format!("{}:{}", method, uri);
    let ha2 = format!("{:x}", md5::compute(ha2_source));

    let resp_source = format!("{}:{}:{}", ha1, nonce, ha2);
    format!("{:x}", md5::compute(resp_source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(
            "Digest realm=\"3402000000\", nonce=\"abc123\", algorithm=MD5",
        )
        .unwrap();

        assert_eq!(challenge.realm, "3402000000");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.algorithm, "MD5");
    }

    #[test]
    fn test_parse_challenge_missing_nonce() {
        assert!(DigestChallenge::parse("Digest realm=\"3402000000\"").is_err());
    }

    #[test]
    fn test_registration_scenario_authorization() {
        // 平台挑战 realm="3402000000" nonce="abc123"，
        // 重发的 REGISTER 必须携带对应的 Digest 应答
        let challenge = DigestChallenge::parse(
            "Digest realm=\"3402000000\", nonce=\"abc123\", algorithm=MD5",
        )
        .unwrap();

        let username = "81000000465001000001";
        let password = "admin123";
        let uri = "sip:3402000000@server:5060";

        let header = challenge.authorization(username, password, "REGISTER", uri);

        assert!(header.contains("username=\"81000000465001000001\""));
        assert!(header.contains("realm=\"3402000000\""));
        assert!(header.contains("nonce=\"abc123\""));
        assert!(header.contains("uri=\"sip:3402000000@server:5060\""));
        assert!(header.contains("algorithm=MD5"));

        let expected = compute_digest_response(username, "3402000000", password, "REGISTER", uri, "abc123");
        assert!(header.contains(&format!("response=\"{}\"", expected)));

        // 与平台侧会执行的校验一致
        let ha1 = format!("{:x}", md5::compute(format!("{}:3402000000:{}", username, password)));
        let ha2 = format!("{:x}", md5::compute(format!("REGISTER:{}", uri)));
        let manual = format!("{:x}", md5::compute(format!("{}:abc123:{}", ha1, ha2)));
        assert_eq!(expected, manual);
    }

    #[test]
    fn test_parse_params_unquoted() {
        let params = parse_digest_params("Digest realm=3402000000, nonce=xyz").unwrap();
        assert_eq!(params.get("realm").unwrap(), "3402000000");
        assert_eq!(params.get("nonce").unwrap(), "xyz");
    }
}
