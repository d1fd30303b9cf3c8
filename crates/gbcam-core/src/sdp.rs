// SDP 会话描述（RFC 4566 + GB28181 y=/f= 扩展）
// 设备侧：解析平台 INVITE 携带的 offer，生成 sendonly answer

use crate::{GbError, Result};

/// SDP 会话描述
#[derive(Debug, Clone)]
pub struct SdpSession {
    /// 版本（v=）
    pub version: u8,

    /// 会话 ID（o= 第二字段）
    pub origin_session_id: String,

    /// 会话版本（o= 第三字段）
    pub origin_version: u64,

    /// 会话源用户名（o= 第一字段）
    pub origin_user: String,

    /// 会话名称（s=，GB28181 为 Play/Playback/Download）
    pub session_name: String,

    /// 连接地址（c=）
    pub connection_address: String,

    /// SSRC（y= 行，GB28181 要求 10 位十进制；原样回显）
    pub ssrc: Option<String>,

    /// 格式描述（f= 行，解析但不强制）
    pub format: Option<String>,

    /// 媒体描述
    pub media: Vec<SdpMedia>,
}

/// SDP 媒体描述
#[derive(Debug, Clone)]
pub struct SdpMedia {
    /// 媒体类型（video/audio）
    pub media_type: String,

    /// 端口
    pub port: u16,

    /// 传输协议（RTP/AVP 或 TCP/RTP/AVP）
    pub protocol: String,

    /// 格式列表
    pub formats: Vec<u8>,

    /// RTP 映射
    pub rtpmap: Vec<RtpMap>,

    /// 其余属性（sendonly/recvonly 等）
    pub attributes: Vec<String>,
}

/// RTP 映射
#[derive(Debug, Clone)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// 从 offer 提炼出的媒体协商结果
#[derive(Debug, Clone)]
pub struct MediaOffer {
    /// RTP 目的地址（c= 行）
    pub remote_ip: String,

    /// RTP 目的端口（m=video）
    pub remote_port: u16,

    /// 传输协议
    pub protocol: String,

    /// 负载类型（首个 rtpmap，缺省 96）
    pub payload_type: u8,

    /// 编码名（H264/PS 等，缺省 PS）
    pub encoding_name: String,

    /// 平台分配的 SSRC，原样回显
    pub ssrc: String,

    /// f= 格式描述
    pub format: Option<String>,
}

impl SdpSession {
    /// 解析 SDP 文本
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut session = SdpSession {
            version: 0,
            origin_session_id: String::new(),
            origin_version: 0,
            origin_user: String::new(),
            session_name: String::new(),
            connection_address: String::new(),
            ssrc: None,
            format: None,
            media: Vec::new(),
        };

        let mut current_media: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(pos) = line.find('=') else {
                continue;
            };
            let key = &line[..pos];
            let value = &line[pos + 1..];

            match key {
                "v" => {
                    session.version = value.parse().unwrap_or(0);
                }
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if !parts.is_empty() {
                        session.origin_user = parts[0].to_string();
                    }
                    if parts.len() >= 2 {
                        session.origin_session_id = parts[1].to_string();
                    }
                    if parts.len() >= 3 {
                        session.origin_version = parts[2].parse().unwrap_or(0);
                    }
                }
                "s" => {
                    session.session_name = value.to_string();
                }
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        session.connection_address = parts[2].to_string();
                    }
                }
                "y" => {
                    session.ssrc = Some(value.trim().to_string());
                }
                "f" => {
                    session.format = Some(value.trim().to_string());
                }
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let formats: Vec<u8> = parts
                            .get(3..)
                            .unwrap_or(&[])
                            .iter()
                            .filter_map(|s| s.parse().ok())
                            .collect();

                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats,
                            rtpmap: Vec::new(),
                            attributes: Vec::new(),
                        });
                    }
                }
                "a" => {
                    if let Some(ref mut media) = current_media {
                        if let Some(rtpmap_str) = value.strip_prefix("rtpmap:") {
                            if let Some(space_pos) = rtpmap_str.find(' ') {
                                let payload_type = rtpmap_str[..space_pos].parse().unwrap_or(0);
                                let rest = &rtpmap_str[space_pos + 1..];

                                if let Some(slash_pos) = rest.find('/') {
                                    let encoding_name = rest[..slash_pos].to_string();
                                    let clock_rate =
                                        rest[slash_pos + 1..].parse().unwrap_or(90000);

                                    media.rtpmap.push(RtpMap {
                                        payload_type,
                                        encoding_name,
                                        clock_rate,
                                    });
                                }
                            }
                        } else {
                            media.attributes.push(value.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }

        Ok(session)
    }

    /// 生成 SDP 文本
    pub fn encode(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.origin_user, self.origin_session_id, self.origin_version, self.connection_address
        ));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        sdp.push_str(&format!("c=IN IP4 {}\r\n", self.connection_address));
        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            ));

            for rtpmap in &media.rtpmap {
                sdp.push_str(&format!(
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding_name, rtpmap.clock_rate
                ));
            }

            for attr in &media.attributes {
                sdp.push_str(&format!("a={}\r\n", attr));
            }
        }

        // y=/f= 在媒体行之后（与主流平台的排布一致）
        if let Some(ssrc) = &self.ssrc {
            sdp.push_str(&format!("y={}\r\n", ssrc));
        }
        if let Some(format) = &self.format {
            sdp.push_str(&format!("f={}\r\n", format));
        }

        sdp
    }

    /// 从 offer 提炼媒体协商参数
    pub fn media_offer(&self) -> Result<MediaOffer> {
        let video = self
            .media
            .iter()
            .find(|m| m.media_type == "video")
            .ok_or_else(|| GbError::Sdp("offer has no m=video line".to_string()))?;

        if self.connection_address.is_empty() {
            return Err(GbError::Sdp("offer has no c= line".to_string()));
        }

        if video.port == 0 {
            return Err(GbError::Sdp("offer video port is 0".to_string()));
        }

        let ssrc = self
            .ssrc
            .clone()
            .ok_or_else(|| GbError::Sdp("offer has no y= (SSRC) line".to_string()))?;

        let (payload_type, encoding_name) = video
            .rtpmap
            .first()
            .map(|r| (r.payload_type, r.encoding_name.clone()))
            .unwrap_or((96, "PS".to_string()));

        Ok(MediaOffer {
            remote_ip: self.connection_address.clone(),
            remote_port: video.port,
            protocol: video.protocol.clone(),
            payload_type,
            encoding_name,
            ssrc,
            format: self.format.clone(),
        })
    }

    /// 基于 offer 生成设备侧 answer
    ///
    /// 回显会话 ID 并递增版本号，镜像负载类型与编码，
    /// c= 指向通告地址，声明 sendonly，y= 原样回显。
    pub fn answer(&self, device_id: &str, contact_ip: &str, local_rtp_port: u16) -> Result<SdpSession> {
        let offer = self.media_offer()?;

        let media = SdpMedia {
            media_type: "video".to_string(),
            port: local_rtp_port,
            protocol: offer.protocol.clone(),
            formats: vec![offer.payload_type],
            rtpmap: vec![RtpMap {
                payload_type: offer.payload_type,
                encoding_name: offer.encoding_name.clone(),
                clock_rate: 90000,
            }],
            attributes: vec!["sendonly".to_string()],
        };

        Ok(SdpSession {
            version: 0,
            origin_user: device_id.to_string(),
            origin_session_id: if self.origin_session_id.is_empty() {
                "0".to_string()
            } else {
                self.origin_session_id.clone()
            },
            origin_version: self.origin_version + 1,
            session_name: if self.session_name.is_empty() {
                "Play".to_string()
            } else {
                self.session_name.clone()
            },
            connection_address: contact_ip.to_string(),
            ssrc: Some(offer.ssrc),
            format: None,
            media: vec![media],
        })
    }

    /// SSRC 的数值形式（RTP 包头使用）
    pub fn ssrc_value(&self) -> Option<u32> {
        self.ssrc.as_deref().and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
                         o=34020000002000000001 100 1 IN IP4 10.0.0.5\r\n\
                         s=Play\r\n\
                         c=IN IP4 10.0.0.5\r\n\
                         t=0 0\r\n\
                         m=video 30000 RTP/AVP 96\r\n\
                         a=rtpmap:96 H264/90000\r\n\
                         a=recvonly\r\n\
                         y=0100000001\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = SdpSession::parse(OFFER).unwrap();
        assert_eq!(sdp.connection_address, "10.0.0.5");
        assert_eq!(sdp.ssrc.as_deref(), Some("0100000001"));
        assert_eq!(sdp.ssrc_value(), Some(100000001));

        let offer = sdp.media_offer().unwrap();
        assert_eq!(offer.remote_ip, "10.0.0.5");
        assert_eq!(offer.remote_port, 30000);
        assert_eq!(offer.payload_type, 96);
        assert_eq!(offer.encoding_name, "H264");
    }

    #[test]
    fn test_answer_mirrors_offer() {
        let sdp = SdpSession::parse(OFFER).unwrap();
        let answer = sdp
            .answer("34020000001320000001", "192.168.1.100", 20000)
            .unwrap();
        let text = answer.encode();

        assert!(text.contains("m=video 20000 RTP/AVP 96\r\n"));
        assert!(text.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(text.contains("a=sendonly\r\n"));
        assert!(text.contains("c=IN IP4 192.168.1.100\r\n"));
        // SSRC 原样回显，保留前导零
        assert!(text.contains("y=0100000001\r\n"));
        // 会话版本递增
        assert!(text.contains("o=34020000001320000001 100 2 IN IP4 192.168.1.100\r\n"));
    }

    #[test]
    fn test_offer_without_video_rejected() {
        let sdp = SdpSession::parse("v=0\r\nc=IN IP4 1.2.3.4\r\ny=1\r\n").unwrap();
        assert!(sdp.media_offer().is_err());
    }

    #[test]
    fn test_offer_without_ssrc_rejected() {
        let no_y = "v=0\r\nc=IN IP4 1.2.3.4\r\nm=video 30000 RTP/AVP 96\r\n";
        let sdp = SdpSession::parse(no_y).unwrap();
        assert!(sdp.media_offer().is_err());
    }

    #[test]
    fn test_tcp_protocol_mirrored() {
        let offer = "v=0\r\n\
                     c=IN IP4 10.0.0.5\r\n\
                     m=video 30000 TCP/RTP/AVP 96\r\n\
                     a=rtpmap:96 PS/90000\r\n\
                     y=0999999999\r\n";
        let sdp = SdpSession::parse(offer).unwrap();
        let answer = sdp.answer("34020000001320000001", "1.2.3.4", 9000).unwrap();
        assert!(answer.encode().contains("m=video 9000 TCP/RTP/AVP 96\r\n"));
    }

    #[test]
    fn test_format_line_parsed() {
        let offer = format!("{}f=v/2/4///a///\r\n", OFFER);
        let sdp = SdpSession::parse(&offer).unwrap();
        assert_eq!(sdp.format.as_deref(), Some("v/2/4///a///"));
    }
}
