//! 自由文本中的检查点事件启发式匹配
//!
//! 四种形式都会扫描，优先级从高到低如下；与更高优先级匹配区间重叠的候选被丢弃，其余按文本顺序返回。
//! 1. `<tool_call>{"name": "...", "arguments": {...}}</tool_call>`
//! 2. `<function=name>{...}</function>`
//! 3. 内联 JSON `{"tool": "...", "args": {...}}`（与 Planner 的 Tool Call 格式一致）
//! 4. `name({...})` 调用形式
//!
//! 只求低误报，不求完备：名称不得含空白且有长度上限，参数文本也有长度上限。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// 通过校验的候选事件
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub arguments: Value,
    /// 匹配在文本中的起止位置（字节，左闭右开）
    pub start: usize,
    pub end: usize,
}

/// 候选校验的上限
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_name_len: usize,
    pub max_args_len: usize,
}

static TAGGED_OPEN_RE: OnceLock<Regex> = OnceLock::new();
static TAGGED_CLOSE_RE: OnceLock<Regex> = OnceLock::new();
static FUNCTION_TAG_RE: OnceLock<Regex> = OnceLock::new();
static TOOL_JSON_RE: OnceLock<Regex> = OnceLock::new();
static CALL_RE: OnceLock<Regex> = OnceLock::new();

fn tagged_open_re() -> &'static Regex {
    TAGGED_OPEN_RE.get_or_init(|| Regex::new(r"<tool_call>\s*").expect("valid tool_call pattern"))
}

fn tagged_close_re() -> &'static Regex {
    TAGGED_CLOSE_RE.get_or_init(|| Regex::new(r"^\s*</tool_call>").expect("valid tool_call close pattern"))
}

fn function_tag_re() -> &'static Regex {
    FUNCTION_TAG_RE
        .get_or_init(|| Regex::new(r"(?s)<function=([^>]*)>(.*?)</function>").expect("valid function tag pattern"))
}

fn tool_json_re() -> &'static Regex {
    TOOL_JSON_RE.get_or_init(|| Regex::new(r#"\{\s*"tool"\s*:"#).expect("valid tool json pattern"))
}

fn call_re() -> &'static Regex {
    CALL_RE.get_or_init(|| {
        Regex::new(r"(?s)([A-Za-z_][A-Za-z0-9_.\-]*)\((\{.*?\})\)").expect("valid call pattern")
    })
}

/// 从文本开头解析一个完整 JSON 值，返回值与消耗的字节数；不完整或非法返回 None
fn parse_json_prefix(s: &str) -> Option<(Value, usize)> {
    let mut stream = serde_json::Deserializer::from_str(s).into_iter::<Value>();
    match stream.next() {
        Some(Ok(v)) => Some((v, stream.byte_offset())),
        _ => None,
    }
}

/// 参数文本解析为 JSON，失败时退化为原始字符串
pub fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn valid_name(name: &str, limits: Limits) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace) && name.chars().count() <= limits.max_name_len
}

fn accept(name: &str, raw_args: &str, arguments: Value, span: (usize, usize), limits: Limits) -> Option<Candidate> {
    if !valid_name(name, limits) || raw_args.len() > limits.max_args_len {
        tracing::debug!(name = %name, "Heuristic candidate rejected");
        return None;
    }
    Some(Candidate {
        name: name.to_string(),
        arguments,
        start: span.0,
        end: span.1,
    })
}

/// 从 JSON 对象中取名称与参数（兼容 name/arguments、tool/args、name/parameters）
fn split_call_object(obj: &Value, name_keys: &[&str], arg_keys: &[&str]) -> Option<(String, Value)> {
    let name = name_keys.iter().find_map(|k| obj.get(*k)?.as_str())?.to_string();
    let args = arg_keys
        .iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    // arguments 可能本身是 JSON 字符串
    let args = match args {
        Value::String(s) => parse_arguments(&s),
        other => other,
    };
    Some((name, args))
}

fn scan_tagged(text: &str, limits: Limits) -> Vec<Candidate> {
    let mut out = Vec::new();
    for open in tagged_open_re().find_iter(text) {
        let body_start = open.end();
        let Some((obj, consumed)) = parse_json_prefix(&text[body_start..]) else {
            continue;
        };
        let after = body_start + consumed;
        let Some(close) = tagged_close_re().find(&text[after..]) else {
            continue;
        };
        let Some((name, args)) = split_call_object(&obj, &["name", "tool"], &["arguments", "args", "parameters"]) else {
            continue;
        };
        let raw = args.to_string();
        out.extend(accept(&name, &raw, args, (open.start(), after + close.end()), limits));
    }
    out
}

fn scan_function_tags(text: &str, limits: Limits) -> Vec<Candidate> {
    function_tag_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?.as_str().trim();
            let raw = caps.get(2)?.as_str();
            accept(name, raw, parse_arguments(raw), (whole.start(), whole.end()), limits)
        })
        .collect()
}

fn scan_tool_json(text: &str, limits: Limits) -> Vec<Candidate> {
    let mut out = Vec::new();
    for m in tool_json_re().find_iter(text) {
        let Some((obj, consumed)) = parse_json_prefix(&text[m.start()..]) else {
            continue;
        };
        let Some((name, args)) = split_call_object(&obj, &["tool"], &["args", "arguments"]) else {
            continue;
        };
        let raw = args.to_string();
        out.extend(accept(&name, &raw, args, (m.start(), m.start() + consumed), limits));
    }
    out
}

fn scan_calls(text: &str, limits: Limits) -> Vec<Candidate> {
    call_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?.as_str();
            let raw = caps.get(2)?.as_str();
            accept(name, raw, parse_arguments(raw), (whole.start(), whole.end()), limits)
        })
        .collect()
}

/// 扫描全部形式；同一段文本只归属优先级最高的匹配，结果按出现位置排序
pub fn scan(text: &str, limits: Limits) -> Vec<Candidate> {
    let scanners: [fn(&str, Limits) -> Vec<Candidate>; 4] =
        [scan_tagged, scan_function_tags, scan_tool_json, scan_calls];
    let mut kept: Vec<Candidate> = Vec::new();
    for scanner in scanners {
        for candidate in scanner(text, limits) {
            if kept.iter().any(|k| k.overlaps(&candidate)) {
                tracing::debug!(name = %candidate.name, "Heuristic candidate shadowed by higher-priority match");
                continue;
            }
            kept.push(candidate);
        }
    }
    kept.sort_by_key(|c| c.start);
    kept
}

impl Candidate {
    fn overlaps(&self, other: &Candidate) -> bool {
        self.start < other.end && other.start < self.end
    }
}
