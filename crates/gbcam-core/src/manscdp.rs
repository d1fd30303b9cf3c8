// MANSCDP XML 编解码
// 解析平台查询，生成与商用平台字节兼容的响应
//
// 渲染用模板而不是序列化器：GB28181 平台对元素顺序和
// <Result>OK</Result> 的存在非常敏感，漏掉 Result 或改动
// Name 标签名都会被平台拒收。

use crate::{GbError, Result};
use quick_xml::de::from_str;
use serde::Deserialize;

/// XML 根元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRoot {
    Query,
    Notify,
    Control,
    Response,
}

/// 查询命令类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdType {
    Catalog,
    DeviceInfo,
    DeviceStatus,
    RecordInfo,
    Keepalive,
    Other(String),
}

impl CmdType {
    fn parse(s: &str) -> Self {
        match s {
            "Catalog" => Self::Catalog,
            "DeviceInfo" => Self::DeviceInfo,
            "DeviceStatus" => Self::DeviceStatus,
            "RecordInfo" => Self::RecordInfo,
            "Keepalive" => Self::Keepalive,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Catalog => "Catalog",
            Self::DeviceInfo => "DeviceInfo",
            Self::DeviceStatus => "DeviceStatus",
            Self::RecordInfo => "RecordInfo",
            Self::Keepalive => "Keepalive",
            Self::Other(s) => s,
        }
    }
}

/// 解析后的 MANSCDP 查询
#[derive(Debug, Clone)]
pub struct ManscdpQuery {
    pub root: QueryRoot,
    pub cmd_type: CmdType,
    pub sn: u32,
    pub device_id: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub record_type: Option<String>,
}

/// 宽容解析用的原始字段集
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawQuery {
    #[serde(default)]
    cmd_type: Option<String>,

    #[serde(rename = "SN", default)]
    sn: Option<String>,

    #[serde(rename = "DeviceID", default)]
    device_id: Option<String>,

    #[serde(default)]
    start_time: Option<String>,

    #[serde(default)]
    end_time: Option<String>,

    #[serde(rename = "Type", default)]
    record_type: Option<String>,
}

/// 解析 MANSCDP 查询
///
/// 宽容处理：接受 GB2312/UTF-8 声明，元素文本两端空白忽略，
/// 未知元素跳过；缺少 SN 视为 bad request。
pub fn parse_query(xml: &str) -> Result<ManscdpQuery> {
    let xml = xml.trim();

    let root = detect_root(xml)
        .ok_or_else(|| GbError::Xml(format!("no root element in {:?}", truncate(xml, 64))))?;

    let raw: RawQuery =
        from_str(xml).map_err(|e| GbError::Xml(format!("MANSCDP parse failed: {}", e)))?;

    let cmd_type = raw
        .cmd_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(CmdType::parse)
        .ok_or_else(|| GbError::BadRequest("missing CmdType".to_string()))?;

    let sn = raw
        .sn
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GbError::BadRequest("missing SN".to_string()))?
        .parse::<u32>()
        .map_err(|_| GbError::BadRequest("SN is not a number".to_string()))?;

    let device_id = raw
        .device_id
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .to_string();

    Ok(ManscdpQuery {
        root,
        cmd_type,
        sn,
        device_id,
        start_time: raw.start_time.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        end_time: raw.end_time.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        record_type: raw.record_type.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
    })
}

/// 识别根元素（跳过 XML 声明）
fn detect_root(xml: &str) -> Option<QueryRoot> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        let after = &rest[start + 1..];
        if after.starts_with('?') || after.starts_with('!') {
            let end = after.find('>')?;
            rest = &after[end + 1..];
            continue;
        }
        let name: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        return match name.as_str() {
            "Query" => Some(QueryRoot::Query),
            "Notify" => Some(QueryRoot::Notify),
            "Control" => Some(QueryRoot::Control),
            "Response" => Some(QueryRoot::Response),
            _ => None,
        };
    }
}

/// 目录项（设备自身或通道）
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub block: String,
    pub address: String,
    pub parental: u8,
    pub parent_id: String,
    pub safety_way: u8,
    pub register_way: u8,
    pub secrecy: u8,
    pub status: String,
}

impl CatalogItem {
    fn render(&self) -> String {
        format!(
            "<Item>\n\
             <DeviceID>{}</DeviceID>\n\
             <Name>{}</Name>\n\
             <Manufacturer>{}</Manufacturer>\n\
             <Model>{}</Model>\n\
             <Owner>{}</Owner>\n\
             <CivilCode>{}</CivilCode>\n\
             <Block>{}</Block>\n\
             <Address>{}</Address>\n\
             <Parental>{}</Parental>\n\
             <ParentID>{}</ParentID>\n\
             <SafetyWay>{}</SafetyWay>\n\
             <RegisterWay>{}</RegisterWay>\n\
             <Secrecy>{}</Secrecy>\n\
             <Status>{}</Status>\n\
             </Item>\n",
            self.device_id,
            self.name,
            self.manufacturer,
            self.model,
            self.owner,
            self.civil_code,
            self.block,
            self.address,
            self.parental,
            self.parent_id,
            self.safety_way,
            self.register_way,
            self.secrecy,
            self.status,
        )
    }
}

/// 历史录像项
#[derive(Debug, Clone)]
pub struct RecordItem {
    pub device_id: String,
    pub name: String,
    pub file_path: String,
    pub start_time: String,
    pub end_time: String,
    pub secrecy: u8,
    pub record_type: String,
}

impl RecordItem {
    fn render(&self) -> String {
        format!(
            "<Item>\n\
             <DeviceID>{}</DeviceID>\n\
             <Name>{}</Name>\n\
             <FilePath>{}</FilePath>\n\
             <StartTime>{}</StartTime>\n\
             <EndTime>{}</EndTime>\n\
             <Secrecy>{}</Secrecy>\n\
             <Type>{}</Type>\n\
             </Item>\n",
            self.device_id,
            self.name,
            self.file_path,
            self.start_time,
            self.end_time,
            self.secrecy,
            self.record_type,
        )
    }
}

fn response_header(cmd_type: &str, sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\n\
         <Response>\n\
         <CmdType>{}</CmdType>\n\
         <SN>{}</SN>\n\
         <DeviceID>{}</DeviceID>\n\
         <Result>OK</Result>\n",
        cmd_type, sn, device_id
    )
}

/// 渲染目录响应
///
/// 不变式：SumNum = DeviceList.Num = Item 数量。
pub fn render_catalog_response(sn: u32, device_id: &str, items: &[CatalogItem]) -> String {
    let n = items.len();
    let mut body = response_header("Catalog", sn, device_id);
    body.push_str(&format!("<SumNum>{}</SumNum>\n<DeviceList Num=\"{}\">\n", n, n));
    for item in items {
        body.push_str(&item.render());
    }
    body.push_str("</DeviceList>\n</Response>");
    body
}

/// 按数据报预算拆分目录响应
///
/// 每个分片自洽：自带 SumNum 与 Num，计数等于分片内 Item 数。
pub fn split_catalog_response(
    sn: u32,
    device_id: &str,
    items: &[CatalogItem],
    budget: usize,
) -> Vec<String> {
    if items.is_empty() {
        return vec![render_catalog_response(sn, device_id, items)];
    }

    let mut fragments = Vec::new();
    let mut chunk: Vec<CatalogItem> = Vec::new();

    for item in items {
        chunk.push(item.clone());
        if render_catalog_response(sn, device_id, &chunk).len() > budget && chunk.len() > 1 {
            let overflow = chunk.pop().unwrap();
            fragments.push(render_catalog_response(sn, device_id, &chunk));
            chunk = vec![overflow];
        }
    }

    if !chunk.is_empty() {
        fragments.push(render_catalog_response(sn, device_id, &chunk));
    }

    fragments
}

/// 渲染设备信息响应
pub fn render_device_info_response(
    sn: u32,
    device_id: &str,
    device_name: &str,
    manufacturer: &str,
    model: &str,
    firmware: &str,
    channel_count: usize,
) -> String {
    let mut body = response_header("DeviceInfo", sn, device_id);
    body.push_str(&format!(
        "<DeviceName>{}</DeviceName>\n\
         <Manufacturer>{}</Manufacturer>\n\
         <Model>{}</Model>\n\
         <Firmware>{}</Firmware>\n\
         <Channel>{}</Channel>\n\
         </Response>",
        device_name, manufacturer, model, firmware, channel_count
    ));
    body
}

/// 渲染设备状态响应
pub fn render_device_status_response(sn: u32, device_id: &str, online: bool) -> String {
    let mut body = response_header("DeviceStatus", sn, device_id);
    body.push_str(&format!(
        "<Online>{}</Online>\n\
         <Status>OK</Status>\n\
         <Encode>ON</Encode>\n\
         <Record>OFF</Record>\n\
         </Response>",
        if online { "ONLINE" } else { "OFFLINE" }
    ));
    body
}

/// 渲染历史录像响应（单页）
///
/// sum_num 为全量条数；分页时各页 Item 是子集，平台按 SN 重组。
pub fn render_record_info_response(
    sn: u32,
    device_id: &str,
    name: &str,
    sum_num: usize,
    items: &[RecordItem],
) -> String {
    let mut body = response_header("RecordInfo", sn, device_id);
    body.push_str(&format!("<Name>{}</Name>\n", name));
    body.push_str(&format!(
        "<SumNum>{}</SumNum>\n<RecordList Num=\"{}\">\n",
        sum_num,
        items.len()
    ));
    for item in items {
        body.push_str(&item.render());
    }
    body.push_str("</RecordList>\n</Response>");
    body
}

/// 按数据报预算为历史录像分页
pub fn paginate_record_info(
    sn: u32,
    device_id: &str,
    name: &str,
    items: &[RecordItem],
    budget: usize,
) -> Vec<String> {
    let total = items.len();
    if total == 0 {
        return vec![render_record_info_response(sn, device_id, name, 0, &[])];
    }

    let mut pages = Vec::new();
    let mut chunk: Vec<RecordItem> = Vec::new();

    for item in items {
        chunk.push(item.clone());
        if render_record_info_response(sn, device_id, name, total, &chunk).len() > budget
            && chunk.len() > 1
        {
            let overflow = chunk.pop().unwrap();
            pages.push(render_record_info_response(sn, device_id, name, total, &chunk));
            chunk = vec![overflow];
        }
    }

    if !chunk.is_empty() {
        pages.push(render_record_info_response(sn, device_id, name, total, &chunk));
    }

    pages
}

/// 渲染心跳通知（设备侧主动发送）
pub fn render_keepalive_notify(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\n\
         <Notify>\n\
         <CmdType>Keepalive</CmdType>\n\
         <SN>{}</SN>\n\
         <DeviceID>{}</DeviceID>\n\
         <Status>OK</Status>\n\
         </Notify>",
        sn, device_id
    )
}

/// 校验响应体的强制元素顺序
///
/// CmdType → SN → DeviceID → Result 必须依次出现。
pub fn validate_response(xml: &str) -> Result<()> {
    let mut pos = 0;
    for tag in ["<CmdType>", "<SN>", "<DeviceID>", "<Result>OK</Result>"] {
        match xml[pos..].find(tag) {
            Some(offset) => pos += offset + tag.len(),
            None => {
                return Err(GbError::Xml(format!(
                    "response missing or misordered element {}",
                    tag
                )))
            }
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.get(..max) {
        Some(head) => head,
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog_query() {
        let xml = r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>Catalog</CmdType>
<SN>275474</SN>
<DeviceID>34020000001110000001</DeviceID>
</Query>"#;

        let query = parse_query(xml).unwrap();
        assert_eq!(query.root, QueryRoot::Query);
        assert_eq!(query.cmd_type, CmdType::Catalog);
        assert_eq!(query.sn, 275474);
        assert_eq!(query.device_id, "34020000001110000001");
    }

    #[test]
    fn test_parse_utf8_declaration() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<Query><CmdType>DeviceInfo</CmdType><SN>1</SN><DeviceID>34020000001110000001</DeviceID></Query>"#;
        let query = parse_query(xml).unwrap();
        assert_eq!(query.cmd_type, CmdType::DeviceInfo);
    }

    #[test]
    fn test_parse_trims_text_and_ignores_unknown() {
        let xml = "<Query><CmdType> RecordInfo </CmdType><SN> 17 </SN>\
                   <DeviceID>34020000001320000001</DeviceID>\
                   <Mystery>ignored</Mystery>\
                   <StartTime>20250515T120000Z</StartTime>\
                   <EndTime>20250515T235959Z</EndTime></Query>";
        let query = parse_query(xml).unwrap();
        assert_eq!(query.cmd_type, CmdType::RecordInfo);
        assert_eq!(query.sn, 17);
        assert_eq!(query.start_time.as_deref(), Some("20250515T120000Z"));
        assert_eq!(query.end_time.as_deref(), Some("20250515T235959Z"));
    }

    #[test]
    fn test_missing_sn_is_bad_request() {
        let xml = "<Query><CmdType>Catalog</CmdType><DeviceID>x</DeviceID></Query>";
        match parse_query(xml) {
            Err(GbError::BadRequest(msg)) => assert!(msg.contains("SN")),
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_control_root_detected() {
        let xml = "<Control><CmdType>DeviceControl</CmdType><SN>9</SN><DeviceID>x</DeviceID></Control>";
        let query = parse_query(xml).unwrap();
        assert_eq!(query.root, QueryRoot::Control);
        assert_eq!(query.cmd_type, CmdType::Other("DeviceControl".to_string()));
    }

    fn sample_items(n: usize) -> Vec<CatalogItem> {
        let device_id = "34020000001110000001";
        let mut items = vec![CatalogItem {
            device_id: device_id.to_string(),
            name: "GBCam Virtual Device".to_string(),
            manufacturer: "GBCam".to_string(),
            model: "Video-File".to_string(),
            owner: "gbcam".to_string(),
            civil_code: "3402000000".to_string(),
            block: String::new(),
            address: "Local".to_string(),
            parental: 1,
            parent_id: device_id.to_string(),
            safety_way: 0,
            register_way: 1,
            secrecy: 0,
            status: "ON".to_string(),
        }];

        for i in 0..n {
            items.push(CatalogItem {
                device_id: format!("{}{:03}", device_id, i + 1),
                name: format!("Cam{}", i + 1),
                manufacturer: "GBCam".to_string(),
                model: "Video-File".to_string(),
                owner: "gbcam".to_string(),
                civil_code: "3402000000".to_string(),
                block: String::new(),
                address: format!("Video-{}", i + 1),
                parental: 0,
                parent_id: device_id.to_string(),
                safety_way: 0,
                register_way: 1,
                secrecy: 0,
                status: "ON".to_string(),
            });
        }

        items
    }

    #[test]
    fn test_catalog_response_counts() {
        // 设备自身 + 三个通道，SumNum = Num = 4
        let items = sample_items(3);
        let xml = render_catalog_response(275474, "34020000001110000001", &items);

        assert!(xml.contains("<SumNum>4</SumNum>"));
        assert!(xml.contains("<DeviceList Num=\"4\">"));
        assert_eq!(xml.matches("<Item>").count(), 4);
        assert!(xml.contains("<SN>275474</SN>"));
        assert!(xml.contains("<Result>OK</Result>"));
        validate_response(&xml).unwrap();
    }

    #[test]
    fn test_catalog_first_item_is_device() {
        let items = sample_items(2);
        let xml = render_catalog_response(1, "34020000001110000001", &items);

        let first_item = &xml[xml.find("<Item>").unwrap()..];
        assert!(first_item.contains("<Parental>1</Parental>"));

        // 其余条目 Parental=0 且 ParentID 指向设备
        assert_eq!(xml.matches("<Parental>0</Parental>").count(), 2);
        assert_eq!(
            xml.matches("<ParentID>34020000001110000001</ParentID>").count(),
            3
        );
    }

    #[test]
    fn test_catalog_split_fragments_self_consistent() {
        let items = sample_items(12);
        let fragments = split_catalog_response(7, "34020000001110000001", &items, 1400);

        assert!(fragments.len() > 1);

        let mut total = 0;
        for fragment in &fragments {
            let n = fragment.matches("<Item>").count();
            assert!(fragment.contains(&format!("<SumNum>{}</SumNum>", n)));
            assert!(fragment.contains(&format!("<DeviceList Num=\"{}\">", n)));
            assert!(fragment.contains("<SN>7</SN>"));
            validate_response(fragment).unwrap();
            total += n;
        }
        assert_eq!(total, 13);
    }

    #[test]
    fn test_empty_catalog_is_valid() {
        let xml = render_catalog_response(5, "34020000001110000001", &[]);
        assert!(xml.contains("<SumNum>0</SumNum>"));
        assert!(xml.contains("<DeviceList Num=\"0\">"));
        validate_response(&xml).unwrap();
    }

    #[test]
    fn test_record_info_pagination_keeps_total() {
        let items: Vec<RecordItem> = (0..30)
            .map(|i| RecordItem {
                device_id: "34020000001320000001".to_string(),
                name: format!("clip-{:02}.mp4", i),
                file_path: format!("/srv/media/clip-{:02}.mp4", i),
                start_time: "20250515T080000Z".to_string(),
                end_time: "20250515T090000Z".to_string(),
                secrecy: 0,
                record_type: "time".to_string(),
            })
            .collect();

        let pages = paginate_record_info(99, "34020000001320000001", "clips", &items, 1400);
        assert!(pages.len() > 1);

        let mut carried = 0;
        for page in &pages {
            assert!(page.contains("<SumNum>30</SumNum>"));
            assert!(page.contains("<SN>99</SN>"));
            carried += page.matches("<Item>").count();
            validate_response(page).unwrap();
        }
        assert_eq!(carried, 30);
    }

    #[test]
    fn test_keepalive_notify() {
        let xml = render_keepalive_notify(3, "34020000001110000001");
        assert!(xml.contains("<CmdType>Keepalive</CmdType>"));
        assert!(xml.contains("<SN>3</SN>"));
        assert!(xml.contains("<Status>OK</Status>"));
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"GB2312\"?>"));
    }

    #[test]
    fn test_rendered_response_reparses() {
        // 自产响应必须能被自身解析器还原关键字段
        let items = sample_items(2);
        let xml = render_catalog_response(88, "34020000001110000001", &items);

        let parsed = parse_query(&xml).unwrap();
        assert_eq!(parsed.root, QueryRoot::Response);
        assert_eq!(parsed.cmd_type, CmdType::Catalog);
        assert_eq!(parsed.sn, 88);
        assert_eq!(parsed.device_id, "34020000001110000001");
    }

    #[test]
    fn test_validate_rejects_missing_result() {
        let xml = "<Response><CmdType>Catalog</CmdType><SN>1</SN><DeviceID>x</DeviceID></Response>";
        assert!(validate_response(xml).is_err());
    }
}
