//! 消息模板：{name} / {phone} 字面替换

use crate::core::recipient::Recipient;

/// 将 template 中每个 `{key}` 字面替换为对应值；未知占位符原样保留
pub fn substitute(template: &str, fields: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in fields {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// 生成发给该收件人的最终消息：活动模板优先，否则使用收件人自带消息
pub fn render_message(campaign_template: Option<&str>, recipient: &Recipient) -> String {
    let raw = campaign_template
        .filter(|t| !t.is_empty())
        .unwrap_or(&recipient.message);
    substitute(
        raw,
        &[("name", recipient.name.as_str()), ("phone", recipient.phone.as_str())],
    )
}
