//! 路径路由模块
//!
//! 核心之外的协作者：给定 URL 与路由表，返回匹配到的模式与对应条目。
//! 纯查找，不做任何分发副作用。模式支持 `<name>` 单段参数与
//! 末尾的 `<path:name>` 吞尾参数。

use std::collections::HashMap;

/// 路由匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    /// 命中的路由模式原文
    pub pattern: String,
    /// 提取出的路径参数
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
    /// 吞掉从当前位置到路径末尾的全部段，必须是模式的最后一段
    Rest(String),
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    pattern: String,
    segments: Vec<Segment>,
}

/// 路由表
///
/// 条目按注册顺序匹配，第一个命中的生效。条目值 `T` 由调用方决定，
/// 通常是处理器工厂。
pub struct Router<T> {
    routes: Vec<(CompiledRoute, T)>,
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// 注册一条路由
    ///
    /// `<path:name>` 参数必须是模式的最后一段，否则视为编程错误直接 panic
    pub fn route(mut self, pattern: &str, value: T) -> Self {
        self.routes.push((compile_pattern(pattern), value));
        self
    }

    /// 查找第一条匹配给定 URL 的路由（忽略查询串）
    pub fn dispatch(&self, url: &str) -> Option<(&T, RouteMatch)> {
        let path = match url.split_once('?') {
            Some((path, _)) => path,
            None => url,
        };
        let segments: Vec<&str> = split_path(path);

        for (route, value) in &self.routes {
            if let Some(params) = match_segments(&route.segments, &segments) {
                return Some((
                    value,
                    RouteMatch {
                        pattern: route.pattern.clone(),
                        params,
                    },
                ));
            }
        }
        None
    }

    /// 路由条目数量
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Router<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn compile_pattern(pattern: &str) -> CompiledRoute {
    let raw_segments = split_path(pattern);
    let mut segments = Vec::with_capacity(raw_segments.len());

    for (pos, raw) in raw_segments.iter().enumerate() {
        if raw.starts_with('<') && raw.ends_with('>') {
            let inner = &raw[1..raw.len() - 1];
            if let Some(name) = inner.strip_prefix("path:") {
                if pos != raw_segments.len() - 1 {
                    panic!(
                        "路由模式 '{}' 中的 path 参数 '{}' 不是最后一段！path 类型参数必须是模式的最后一段",
                        pattern, name
                    );
                }
                segments.push(Segment::Rest(name.to_string()));
            } else {
                segments.push(Segment::Param(inner.to_string()));
            }
        } else {
            segments.push(Segment::Literal(raw.to_string()));
        }
    }

    CompiledRoute {
        pattern: pattern.to_string(),
        segments,
    }
}

fn match_segments(
    pattern: &[Segment],
    path: &[&str],
) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();

    for (pos, segment) in pattern.iter().enumerate() {
        match segment {
            Segment::Literal(expected) => {
                if *path.get(pos)? != expected.as_str() {
                    return None;
                }
            }
            Segment::Param(name) => {
                let value = path.get(pos)?;
                params.insert(name.clone(), value.to_string());
            }
            Segment::Rest(name) => {
                if pos >= path.len() {
                    return None;
                }
                params.insert(name.clone(), path[pos..].join("/"));
                return Some(params);
            }
        }
    }

    if path.len() == pattern.len() {
        Some(params)
    } else {
        None
    }
}
