//! 通用工具函数

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 生成就诊外部引用（二维码内容与患者查询键）
///
/// 对患者、医生、创建时间以及一次性随机数做 SHA-256 摘要，
/// 结果不可逆推出患者身份，且随机数使其无法通过枚举时间戳猜出。
pub fn generate_visit_reference(
    patient_id: Uuid,
    doctor_id: Uuid,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(patient_id.as_bytes());
    hasher.update(doctor_id.as_bytes());
    hasher.update(created_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 验证外部引用格式（64位小写十六进制）
pub fn is_valid_visit_reference(reference: &str) -> bool {
    reference.len() == 64
        && reference
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// 计算号源所属的自然日
pub fn service_day(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}
