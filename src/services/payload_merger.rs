//! 数据合并服务 - 业务能力层
//!
//! 把同一任务下多个计数选项导出的 CSV 合并成一张表：
//! 第一份数据保留全部行，之后每份数据丢弃首行（重复的表头）。

use crate::error::ParseError;
use crate::models::{RawPayload, RowSet};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// 按顺序合并多份原始数据
///
/// 空列表返回空表；某份数据没有任何行时直接跳过。
pub fn merge(payloads: &[RawPayload]) -> Result<RowSet, ParseError> {
    let mut merged = RowSet::default();

    for (index, payload) in payloads.iter().enumerate() {
        let rows = parse_payload(index, payload)?;
        let skip = usize::from(index > 0);
        merged.extend(rows.into_iter().skip(skip));
    }

    Ok(merged)
}

/// 解析单份数据，允许字段内出现未转义的引号，允许每行列数不同
fn parse_payload(index: usize, payload: &RawPayload) -> Result<Vec<Vec<String>>, ParseError> {
    let bytes = payload.as_bytes();
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    ensure_quotes_closed(index, bytes)?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ParseError::Malformed {
            payload: index,
            source,
        })?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(rows)
}

/// csv 读取器在文件结尾会直接收尾未闭合的引号字段，这里单独检查
fn ensure_quotes_closed(index: usize, bytes: &[u8]) -> Result<(), ParseError> {
    let mut line = 1u64;
    let mut opened_at = 1u64;
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_quotes {
            match b {
                b'"' if bytes.get(i + 1) == Some(&b'"') => i += 1,
                b'"' => in_quotes = false,
                b'\n' => line += 1,
                b'\r' if bytes.get(i + 1) != Some(&b'\n') => line += 1,
                _ => {}
            }
        } else {
            match b {
                b'"' if at_field_start => {
                    in_quotes = true;
                    opened_at = line;
                    at_field_start = false;
                }
                b',' => at_field_start = true,
                b'\n' => {
                    line += 1;
                    at_field_start = true;
                }
                // 单独的 \r 也是记录结尾，\r\n 只在 \n 处计行
                b'\r' => {
                    if bytes.get(i + 1) != Some(&b'\n') {
                        line += 1;
                    }
                    at_field_start = true;
                }
                _ => at_field_start = false,
            }
        }
        i += 1;
    }

    if in_quotes {
        Err(ParseError::UnterminatedQuote {
            payload: index,
            line: opened_at,
        })
    } else {
        Ok(())
    }
}
