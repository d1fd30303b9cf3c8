// RTP 发送端（RFC 3550）
// H.264 负载按 RFC 6184 单包/FU-A 分片；PS 负载为 PES 封装

use crate::{GbError, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// 单个 RTP 负载的最大字节数（留出 IP/UDP/RTP 头）
const RTP_PAYLOAD_MTU: usize = 1400;

const FUA_HEADER_SIZE: usize = 2;

/// RTP 发送器
///
/// 每个管线独占一个 socket，序列号与时间戳由发送器推进。
pub struct RtpSender {
    socket: UdpSocket,
    target: SocketAddr,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSender {
    /// 绑定临时端口并指向目的地址
    pub async fn connect(target: SocketAddr, payload_type: u8, ssrc: u32) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| GbError::Transport(format!("bind RTP socket failed: {}", e)))?;

        Ok(Self {
            socket,
            target,
            payload_type,
            ssrc,
            sequence: 1,
            timestamp: 0,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// 组 RTP 包头 + 负载
    fn build_packet(&mut self, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(12 + payload.len());
        let m_pt = if marker {
            0x80 | self.payload_type
        } else {
            self.payload_type
        };

        packet.push(0x80); // V=2
        packet.push(m_pt);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    async fn send_packet(&mut self, marker: bool, payload: &[u8]) -> Result<()> {
        let packet = self.build_packet(marker, payload);
        self.socket
            .send_to(&packet, self.target)
            .await
            .map_err(|e| GbError::Transport(format!("RTP send failed: {}", e)))?;
        Ok(())
    }

    /// 发送一帧 H.264（Annex B），末包置 marker
    pub async fn send_h264_frame(&mut self, annexb: &[u8], ts_increment: u32) -> Result<()> {
        let payloads = h264_payloads(annexb, RTP_PAYLOAD_MTU);
        let last = payloads.len().saturating_sub(1);

        for (i, payload) in payloads.iter().enumerate() {
            self.send_packet(i == last, payload).await?;
        }

        self.timestamp = self.timestamp.wrapping_add(ts_increment);
        Ok(())
    }

    /// 发送一帧 PS 数据，超 MTU 时拆分，末包置 marker
    pub async fn send_ps_frame(&mut self, ps: &[u8], ts_increment: u32) -> Result<()> {
        let chunks: Vec<&[u8]> = ps.chunks(RTP_PAYLOAD_MTU).collect();
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            self.send_packet(i == last, chunk).await?;
        }

        self.timestamp = self.timestamp.wrapping_add(ts_increment);
        Ok(())
    }
}

/// 把一帧 Annex B 数据拆为 RTP 负载序列
///
/// NALU 不超过 MTU 时整包发送，否则 FU-A 分片。
pub fn h264_payloads(annexb: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();

    for nalu in split_nalus(annexb) {
        emit_nalu(nalu, mtu, &mut payloads);
    }

    payloads
}

/// 按起始码（00 00 01 / 00 00 00 01）切分 NALU
fn split_nalus(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut starts = Vec::new();

    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, 3));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    if starts.is_empty() {
        if !data.is_empty() {
            nalus.push(data);
        }
        return nalus;
    }

    for (idx, (start, code_len)) in starts.iter().enumerate() {
        let begin = start + code_len;
        let end = starts
            .get(idx + 1)
            .map(|(next, _)| *next)
            .unwrap_or(data.len());
        if begin < end {
            nalus.push(&data[begin..end]);
        }
    }

    nalus
}

fn emit_nalu(nalu: &[u8], mtu: usize, payloads: &mut Vec<Vec<u8>>) {
    if nalu.is_empty() {
        return;
    }

    let nalu_type = nalu[0] & 0x1F;
    let nalu_ref_idc = nalu[0] & 0x60;

    // AUD/填充不上线
    if nalu_type == 9 || nalu_type == 12 {
        return;
    }

    if nalu.len() <= mtu {
        payloads.push(nalu.to_vec());
        return;
    }

    // FU-A：首字节 indicator（F|NRI|28），次字节 header（S|E|type）
    let max_fragment = mtu - FUA_HEADER_SIZE;
    let body = &nalu[1..];
    let mut offset = 0;

    while offset < body.len() {
        let take = max_fragment.min(body.len() - offset);
        let mut out = Vec::with_capacity(FUA_HEADER_SIZE + take);

        out.push(28 | nalu_ref_idc);

        let mut header = nalu_type;
        if offset == 0 {
            header |= 1 << 7; // S
        } else if offset + take == body.len() {
            header |= 1 << 6; // E
        }
        out.push(header);

        out.extend_from_slice(&body[offset..offset + take]);
        payloads.push(out);

        offset += take;
    }
}

/// 把一帧 H.264 数据封为 PS（PES 头 + 载荷）
pub fn ps_wrap(h264: &[u8]) -> Bytes {
    let pes_length = (h264.len() + 3) as u16;

    let mut buf = Vec::with_capacity(6 + pes_length as usize);
    buf.extend_from_slice(&[0x00, 0x00, 0x01, 0xE0]);
    buf.extend_from_slice(&pes_length.to_be_bytes());
    buf.extend_from_slice(&[0x80, 0x00, 0x00]);
    buf.extend_from_slice(h264);

    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb_frame(nalu_sizes: &[usize]) -> Vec<u8> {
        let mut data = Vec::new();
        for (i, size) in nalu_sizes.iter().enumerate() {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.push(0x65); // IDR
            data.extend_from_slice(&vec![0x40 + i as u8; *size]);
        }
        data
    }

    #[test]
    fn test_split_nalus() {
        let data = annexb_frame(&[8, 16]);
        let nalus = split_nalus(&data);
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].len(), 9);
        assert_eq!(nalus[1].len(), 17);
    }

    #[test]
    fn test_small_nalu_single_payload() {
        let data = annexb_frame(&[100]);
        let payloads = h264_payloads(&data, 1400);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0][0] & 0x1F, 5);
    }

    #[test]
    fn test_large_nalu_fua_fragments() {
        let data = annexb_frame(&[4000]);
        let payloads = h264_payloads(&data, 1400);
        assert!(payloads.len() >= 3);

        // 所有分片 indicator type=28，首片置 S，末片置 E
        for p in &payloads {
            assert_eq!(p[0] & 0x1F, 28);
        }
        assert_eq!(payloads.first().unwrap()[1] & 0x80, 0x80);
        assert_eq!(payloads.last().unwrap()[1] & 0x40, 0x40);

        // 分片重组应还原 NALU 体（去掉首字节后共 4000 字节）
        let rebuilt: Vec<u8> = payloads.iter().flat_map(|p| p[2..].to_vec()).collect();
        assert_eq!(rebuilt.len(), 4000);
    }

    #[test]
    fn test_ps_wrap_layout() {
        let payload = vec![1u8, 2, 3, 4];
        let ps = ps_wrap(&payload);
        assert_eq!(&ps[..4], &[0x00, 0x00, 0x01, 0xE0]);
        let declared = u16::from_be_bytes([ps[4], ps[5]]) as usize;
        assert_eq!(declared, payload.len() + 3);
        assert_eq!(&ps[9..], &payload[..]);
    }

    #[tokio::test]
    async fn test_rtp_packet_header() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let mut sender = RtpSender::connect(target, 96, 100000001).await.unwrap();
        sender.send_ps_frame(b"payload", 3600).await.unwrap();

        let mut buf = [0u8; 1500];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();

        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1] & 0x7F, 96);
        assert_eq!(buf[1] & 0x80, 0x80); // 单包帧带 marker
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(ssrc, 100000001);
        assert_eq!(&buf[12..len], b"payload");
    }

    #[tokio::test]
    async fn test_sequence_increments() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let mut sender = RtpSender::connect(target, 96, 7).await.unwrap();
        sender.send_ps_frame(b"a", 3600).await.unwrap();
        sender.send_ps_frame(b"b", 3600).await.unwrap();

        let mut buf = [0u8; 64];
        let (_, _) = receiver.recv_from(&mut buf).await.unwrap();
        let seq1 = u16::from_be_bytes([buf[2], buf[3]]);
        let ts1 = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let (_, _) = receiver.recv_from(&mut buf).await.unwrap();
        let seq2 = u16::from_be_bytes([buf[2], buf[3]]);
        let ts2 = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        assert_eq!(seq2, seq1 + 1);
        assert_eq!(ts2, ts1 + 3600);
    }
}
