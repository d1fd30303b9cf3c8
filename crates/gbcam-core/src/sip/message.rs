// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式
//
// 头部按出现顺序保存，允许同名重复（Via/Route/Record-Route），
// Content-Length 为消息体长度的唯一依据。

use crate::{GbError, Result};
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Options,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Info => write!(f, "INFO"),
        }
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "OPTIONS" => Some(SipMethod::Options),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

/// 有序头部表
///
/// SIP 允许同名头部重复且响应必须按请求顺序回显，
/// 因此不能用 HashMap 承载。
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个头部（保留已有同名头部）
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// 设置头部：替换第一个同名头部，删除其余同名头部
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value));
        }
    }

    /// 第一个同名头部的值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 所有同名头部的值，按出现顺序
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// 删除所有同名头部
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    /// Call-ID 头部
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq 序号与方法
    pub fn cseq(&self) -> Option<(u32, &str)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    /// From 标签
    pub fn from_tag(&self) -> Option<&str> {
        self.headers.get("From").and_then(extract_tag)
    }

    /// To 标签
    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("To").and_then(extract_tag)
    }

    /// 请求行/To 中的目标用户（通道或设备 ID）
    pub fn target_user(&self) -> Option<&str> {
        extract_sip_user(&self.uri).or_else(|| self.headers.get("To").and_then(extract_sip_user))
    }

    /// 生成 SIP 请求报文
    pub fn encode(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        encode_headers_and_body(&mut out, &self.headers, self.body.as_deref());
        out
    }

    /// 从报文解析 SIP 请求
    pub fn parse(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let mut parts = start_line.split_whitespace();
        let method = parts
            .next()
            .and_then(SipMethod::parse)
            .ok_or_else(|| GbError::SipParse(format!("unknown method in {:?}", start_line)))?;
        let uri = parts
            .next()
            .ok_or_else(|| GbError::SipParse("missing request URI".to_string()))?
            .to_string();
        let version = parts.next().unwrap_or("SIP/2.0").to_string();

        Ok(Self {
            method,
            uri,
            version,
            headers,
            body,
        })
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, &str)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("To").and_then(extract_tag)
    }

    /// Via 中的事务 branch
    pub fn branch(&self) -> Option<&str> {
        self.headers.get("Via").and_then(extract_branch)
    }

    /// 生成 SIP 响应报文
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        );
        encode_headers_and_body(&mut out, &self.headers, self.body.as_deref());
        out
    }

    /// 从报文解析 SIP 响应
    pub fn parse(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let mut parts = start_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| GbError::SipParse("empty status line".to_string()))?
            .to_string();
        let status_code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| GbError::SipParse(format!("bad status code in {:?}", start_line)))?;
        let reason_phrase = parts.next().unwrap_or("").to_string();

        Ok(Self {
            version,
            status_code,
            reason_phrase,
            headers,
            body,
        })
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从报文解析 SIP 消息
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::parse(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::parse(s)?))
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SipMessage::Request(req) => req.encode(),
            SipMessage::Response(resp) => resp.encode(),
        }
    }
}

/// 解析 CSeq 头部值
pub fn parse_cseq(value: &str) -> Option<(u32, &str)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = parts.next()?;
    Some((seq, method))
}

/// 从 From/To 头部提取 tag 参数
pub fn extract_tag(value: &str) -> Option<&str> {
    for param in value.split(';').skip(1) {
        let param = param.trim();
        if let Some(tag) = param.strip_prefix("tag=") {
            return Some(tag);
        }
    }
    None
}

/// 从 Via 头部提取 branch 参数
pub fn extract_branch(value: &str) -> Option<&str> {
    for param in value.split(';').skip(1) {
        let param = param.trim();
        if let Some(branch) = param.strip_prefix("branch=") {
            return Some(branch);
        }
    }
    None
}

/// 从 `sip:user@host` 形式中提取 user 部分
pub fn extract_sip_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest.find(['@', ';', '>']).unwrap_or(rest.len());
    let user = &rest[..end];
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

fn encode_headers_and_body(out: &mut String, headers: &Headers, body: Option<&str>) {
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body_len));
    if let Some(body) = body {
        out.push_str(body);
    }
}

/// 拆出起始行、头部和消息体
///
/// 接受裸 LF 行结束；消息体长度以 Content-Length 为准。
fn split_message(s: &str) -> Result<(String, Headers, Option<String>)> {
    let (head, raw_body) = match s.find("\r\n\r\n") {
        Some(pos) => (&s[..pos], &s[pos + 4..]),
        None => match s.find("\n\n") {
            Some(pos) => (&s[..pos], &s[pos + 2..]),
            None => (s, ""),
        },
    };

    let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| GbError::SipParse("empty SIP message".to_string()))?
        .to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(pos) = line.find(':') {
            let name = line[..pos].trim();
            let value = line[pos + 1..].trim();
            headers.append(name, value);
        }
    }

    let content_length = headers
        .get("Content-Length")
        .and_then(|v| v.parse::<usize>().ok());

    let body = match content_length {
        Some(0) => None,
        Some(len) => {
            let take = len.min(raw_body.len());
            Some(raw_body[..take].to_string())
        }
        None => {
            if raw_body.is_empty() {
                None
            } else {
                Some(raw_body.to_string())
            }
        }
    };

    Ok((start_line, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encode() {
        let mut req = SipRequest::new(
            SipMethod::Register,
            "sip:34020000002000000001@3402000000",
        );
        req.headers
            .append("Via", "SIP/2.0/UDP 192.168.1.100:5080;branch=z9hG4bKabc");
        req.headers
            .append("From", "<sip:34020000001110000001@3402000000>;tag=98765");
        req.headers
            .append("To", "<sip:34020000001110000001@3402000000>");
        req.headers.append("Call-ID", "123456789@192.168.1.100");
        req.headers.append("CSeq", "1 REGISTER");

        let encoded = req.encode();
        assert!(encoded.starts_with("REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n"));
        assert!(encoded.contains("Via: SIP/2.0/UDP 192.168.1.100:5080;branch=z9hG4bKabc\r\n"));
        assert!(encoded.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_request_parse_with_body() {
        let raw = "MESSAGE sip:34020000001110000001@3402000000 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776\r\n\
                   From: <sip:34020000002000000001@3402000000>;tag=z1\r\n\
                   To: <sip:34020000001110000001@3402000000>\r\n\
                   Call-ID: 42@10.0.0.1\r\n\
                   CSeq: 20 MESSAGE\r\n\
                   Content-Type: Application/MANSCDP+xml\r\n\
                   Content-Length: 11\r\n\
                   \r\n\
                   hello world";

        let req = SipRequest::parse(raw).unwrap();
        assert_eq!(req.method, SipMethod::Message);
        assert_eq!(req.call_id(), Some("42@10.0.0.1"));
        assert_eq!(req.cseq(), Some((20, "MESSAGE")));
        assert_eq!(req.from_tag(), Some("z1"));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.body.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_parse_bare_lf() {
        let raw = "OPTIONS sip:34020000001110000001@3402000000 SIP/2.0\n\
                   Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\n\
                   Call-ID: a@b\n\
                   CSeq: 1 OPTIONS\n\
                   Content-Length: 0\n\
                   \n";
        let req = SipRequest::parse(raw).unwrap();
        assert_eq!(req.method, SipMethod::Options);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_content_length_authoritative() {
        // 尾部多出的字节不属于消息体
        let raw = "MESSAGE sip:a@b SIP/2.0\r\n\
                   Call-ID: x@y\r\n\
                   Content-Length: 5\r\n\
                   \r\n\
                   hellojunk";
        let req = SipRequest::parse(raw).unwrap();
        assert_eq!(req.body.as_deref(), Some("hello"));
    }

    #[test]
    fn test_multiple_route_headers_preserved() {
        let raw = "INVITE sip:34020000001320000001@3402000000 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP proxy1;branch=z9hG4bKa\r\n\
                   Via: SIP/2.0/UDP origin;branch=z9hG4bKb\r\n\
                   Record-Route: <sip:proxy1.example;lr>\r\n\
                   Record-Route: <sip:proxy2.example;lr>\r\n\
                   Route: <sip:next.example;lr>\r\n\
                   Call-ID: rr@test\r\n\
                   CSeq: 1 INVITE\r\n\
                   Content-Length: 0\r\n\
                   \r\n";

        let req = SipRequest::parse(raw).unwrap();
        assert_eq!(req.headers.get_all("Via").len(), 2);
        assert_eq!(
            req.headers.get_all("Record-Route"),
            vec!["<sip:proxy1.example;lr>", "<sip:proxy2.example;lr>"]
        );
        assert_eq!(req.headers.get("Route"), Some("<sip:next.example;lr>"));
    }

    #[test]
    fn test_response_roundtrip() {
        let mut resp = SipResponse::new(401, "Unauthorized");
        resp.headers
            .append("Via", "SIP/2.0/UDP 10.0.0.1:5080;branch=z9hG4bKxyz");
        resp.headers
            .append("To", "<sip:34020000001110000001@3402000000>;tag=as7d9");
        resp.headers.append(
            "WWW-Authenticate",
            "Digest realm=\"3402000000\", nonce=\"abc123\", algorithm=MD5",
        );

        let parsed = SipResponse::parse(&resp.encode()).unwrap();
        assert_eq!(parsed.status_code, 401);
        assert_eq!(parsed.reason_phrase, "Unauthorized");
        assert_eq!(parsed.to_tag(), Some("as7d9"));
        assert_eq!(parsed.branch(), Some("z9hG4bKxyz"));
    }

    #[test]
    fn test_headers_set_replaces_all() {
        let mut headers = Headers::new();
        headers.append("Via", "a");
        headers.append("Via", "b");
        headers.set("Via", "c");
        assert_eq!(headers.get_all("Via"), vec!["c"]);
    }

    #[test]
    fn test_extract_sip_user() {
        assert_eq!(
            extract_sip_user("sip:34020000001320000001@3402000000"),
            Some("34020000001320000001")
        );
        assert_eq!(
            extract_sip_user("<sip:34020000001320000001@10.0.0.1:5060>;tag=1"),
            Some("34020000001320000001")
        );
        assert_eq!(extract_sip_user("no-uri-here"), None);
    }
}
