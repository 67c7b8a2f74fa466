//! 驱动集成测试
//!
//! 使用真实 TCP 连接验证完整链路：创建命令 → 就绪事件 → 请求事件 →
//! 发送动作 → 分发器写回，以及关闭命令的实例隔离语义。
//! 统一用预打开句柄绑定临时端口，避免端口冲突。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use hyper::http::Method;
use rat_flux::{
    BodyReaderMiddleware, CreateConfig, DynMiddleware, EventKind, FluxCommand, FluxEngine,
    FluxError, FnMiddleware, InboundRequest, SendOptions, ServerEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// 发起一次 HTTP/1.1 GET 并读回完整响应文本
async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("连接服务器失败");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("发送请求失败");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("读取响应失败");
    String::from_utf8_lossy(&response).into_owned()
}

/// 发起一次携带请求体的 HTTP/1.1 POST
async fn http_post(addr: SocketAddr, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("连接服务器失败");
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("发送请求失败");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("读取响应失败");
    String::from_utf8_lossy(&response).into_owned()
}

/// 绑定一个临时端口的预打开句柄
fn ephemeral_listener() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("绑定临时端口失败");
    let addr = listener.local_addr().expect("读取本地地址失败");
    (listener, addr)
}

/// 为指定实例挂一个固定文本应答器
fn spawn_text_responder(engine: &Arc<FluxEngine>, instance_id: &str, reply: &'static str) {
    let mut requests = engine.select(instance_id).events(EventKind::Request);
    let engine = engine.clone();
    tokio::spawn(async move {
        while let Some(Ok(ServerEvent::Request(request))) = requests.next().await {
            let action = request.response.text(reply, SendOptions::new());
            let _ = engine.send(FluxCommand::Send(action));
        }
    });
}

/// 轮询直到监听端口拒绝连接
async fn wait_until_refused(addr: SocketAddr) {
    for _ in 0..100 {
        match TcpStream::connect(addr).await {
            Err(_) => return,
            Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
        }
    }
    panic!("监听器 {} 在关闭后仍然接受连接", addr);
}

#[tokio::test]
async fn test_ready_then_request_roundtrip() {
    let engine = Arc::new(FluxEngine::builder().start());
    let (listener, addr) = ephemeral_listener();

    let mut ready = engine.select("api").events(EventKind::Ready);
    let mut requests = engine.select("api").events(EventKind::Request);
    engine
        .create(CreateConfig::new("api").handle(listener))
        .unwrap();

    // 就绪事件先于任何请求事件，恰好一次，携带绑定地址
    let ready_event = match ready.next().await {
        Some(Ok(ServerEvent::Ready(event))) => event,
        other => panic!("期望就绪事件，得到 {:?}", other),
    };
    assert_eq!(ready_event.instance_id, "api");
    assert_eq!(ready_event.local_addr, Some(addr));

    let client = tokio::spawn(async move {
        http_get(addr, "/hello?name=%E4%B8%96%E7%95%8C").await
    });

    let request = match requests.next().await {
        Some(Ok(ServerEvent::Request(request))) => request,
        other => panic!("期望请求事件，得到 {:?}", other),
    };
    assert_eq!(request.instance_id, "api");
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.path(), "/hello");
    assert_eq!(
        request.query_params().get("name").map(String::as_str),
        Some("世界")
    );
    // 未配置读体中间件时 body 保持 None
    assert!(request.body.is_none());
    assert_eq!(request.header("host"), Some("localhost"));
    // 原始请求体流至多取出一次
    assert!(request.take_payload().is_some());
    assert!(request.take_payload().is_none());

    let action = request
        .response
        .json(&serde_json::json!({"hello": true}), SendOptions::new())
        .unwrap();
    assert_eq!(action.instance_id, "api");
    engine.send(FluxCommand::Send(action)).unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "响应: {}", response);
    assert!(
        response
            .to_lowercase()
            .contains("content-type: application/json")
    );
    assert!(response.ends_with(r#"{"hello":true}"#));

    engine.shutdown();
}

#[tokio::test]
async fn test_redirect_has_no_body() {
    let engine = Arc::new(FluxEngine::builder().start());
    let (listener, addr) = ephemeral_listener();

    let mut ready = engine.select("redir").events(EventKind::Ready);
    let mut requests = engine.select("redir").events(EventKind::Request);
    engine
        .create(CreateConfig::new("redir").handle(listener))
        .unwrap();
    ready.next().await.unwrap().unwrap();

    let client = tokio::spawn(async move { http_get(addr, "/old").await });
    let request = match requests.next().await {
        Some(Ok(ServerEvent::Request(request))) => request,
        other => panic!("期望请求事件，得到 {:?}", other),
    };
    let action = request.response.redirect("/new", SendOptions::new());
    engine.send(FluxCommand::Send(action)).unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 302"), "响应: {}", response);
    assert!(response.to_lowercase().contains("location: /new"));
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    assert!(body.is_empty(), "重定向不应有响应体: {:?}", body);

    engine.shutdown();
}

#[tokio::test]
async fn test_close_only_affects_target_instance() {
    let engine = Arc::new(FluxEngine::builder().start());
    let (listener_a, _addr_a) = ephemeral_listener();
    let (listener_b, addr_b) = ephemeral_listener();

    let mut ready_a = engine.select("a").events(EventKind::Ready);
    let mut ready_b = engine.select("b").events(EventKind::Ready);
    let mut requests_a = engine.select("a").events(EventKind::Request);
    spawn_text_responder(&engine, "b", "pong");

    engine.create(CreateConfig::new("a").handle(listener_a)).unwrap();
    engine.create(CreateConfig::new("b").handle(listener_b)).unwrap();
    ready_a.next().await.unwrap().unwrap();
    ready_b.next().await.unwrap().unwrap();

    engine.close("a").unwrap();

    // a 的事件序列正常终止
    assert!(requests_a.next().await.is_none());
    assert!(ready_a.next().await.is_none());

    // b 不受影响，继续完成完整的请求/响应回路
    let response = http_get(addr_b, "/ping").await;
    assert!(response.starts_with("HTTP/1.1 200"), "响应: {}", response);
    assert!(response.ends_with("pong"));

    engine.shutdown();
}

#[tokio::test]
async fn test_duplicate_ids_spawn_independent_listeners() {
    let engine = Arc::new(FluxEngine::builder().start());
    let (listener_1, addr_1) = ephemeral_listener();
    let (listener_2, addr_2) = ephemeral_listener();

    let mut ready = engine.select("dup").events(EventKind::Ready);
    spawn_text_responder(&engine, "dup", "pong");

    // 相同标识的两个 create 并行启动互不合并的监听器
    engine.create(CreateConfig::new("dup").handle(listener_1)).unwrap();
    engine.create(CreateConfig::new("dup").handle(listener_2)).unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match ready.next().await {
            Some(Ok(ServerEvent::Ready(event))) => seen.push(event.local_addr),
            other => panic!("期望就绪事件，得到 {:?}", other),
        }
    }
    assert!(seen.contains(&Some(addr_1)));
    assert!(seen.contains(&Some(addr_2)));

    // 两个监听器同时存活
    let response_1 = http_get(addr_1, "/one").await;
    let response_2 = http_get(addr_2, "/two").await;
    assert!(response_1.ends_with("pong"));
    assert!(response_2.ends_with("pong"));

    // close 按标识匹配：一条命令关掉两个监听器
    engine.close("dup").unwrap();
    assert!(ready.next().await.is_none());
    wait_until_refused(addr_1).await;
    wait_until_refused(addr_2).await;

    engine.shutdown();
}

#[tokio::test]
async fn test_middleware_error_terminates_instance_stream() {
    let engine = Arc::new(FluxEngine::builder().start());
    let (listener, addr) = ephemeral_listener();

    let boom: DynMiddleware = Arc::new(FnMiddleware::new(|req: &mut InboundRequest| {
        if req.uri.path() == "/boom" {
            Err(FluxError::MiddlewareError("禁止访问".to_string()))
        } else {
            Ok(())
        }
    }));

    let mut ready = engine.select("fragile").events(EventKind::Ready);
    let mut requests = engine.select("fragile").events(EventKind::Request);
    engine
        .create(CreateConfig::new("fragile").handle(listener).middleware(boom))
        .unwrap();
    ready.next().await.unwrap().unwrap();

    let response = http_get(addr, "/boom").await;
    assert!(response.starts_with("HTTP/1.1 500"), "响应: {}", response);

    // 中间件错误是实例级致命错误：事件流以一条错误项结束
    match requests.next().await {
        Some(Err(FluxError::MiddlewareError(_))) => {}
        other => panic!("期望中间件错误，得到 {:?}", other),
    }
    assert!(requests.next().await.is_none());

    // 实例的监听器也被释放
    wait_until_refused(addr).await;

    engine.shutdown();
}

#[tokio::test]
async fn test_body_reader_middleware_attaches_body() {
    let engine = Arc::new(FluxEngine::builder().start());
    let (listener, addr) = ephemeral_listener();

    let mut ready = engine.select("post").events(EventKind::Ready);
    let mut requests = engine.select("post").events(EventKind::Request);
    engine
        .create(
            CreateConfig::new("post")
                .handle(listener)
                .middleware(Arc::new(BodyReaderMiddleware::new())),
        )
        .unwrap();
    ready.next().await.unwrap().unwrap();

    let client = tokio::spawn(async move {
        http_post(addr, "/users", r#"{"name":"flux"}"#).await
    });

    let request = match requests.next().await {
        Some(Ok(ServerEvent::Request(request))) => request,
        other => panic!("期望请求事件，得到 {:?}", other),
    };
    assert_eq!(request.method, Method::POST);
    let body: serde_json::Value = request.json_body().unwrap();
    assert_eq!(body, serde_json::json!({"name": "flux"}));

    let action = request.response.text("created", SendOptions::new().status_code(201));
    engine.send(FluxCommand::Send(action)).unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 201"), "响应: {}", response);

    engine.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_instance() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let socket_path = dir.path().join("flux.sock");

    let engine = Arc::new(FluxEngine::builder().start());
    let mut ready = engine.select("uds").events(EventKind::Ready);
    let mut requests = engine.select("uds").events(EventKind::Request);
    engine
        .create(CreateConfig::new("uds").path(&socket_path))
        .unwrap();

    // unix 套接字没有 TCP 地址
    let ready_event = match ready.next().await {
        Some(Ok(ServerEvent::Ready(event))) => event,
        other => panic!("期望就绪事件，得到 {:?}", other),
    };
    assert!(ready_event.local_addr.is_none());

    let client_path = socket_path.clone();
    let client = tokio::spawn(async move {
        let mut stream = tokio::net::UnixStream::connect(&client_path)
            .await
            .expect("连接 unix 套接字失败");
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("发送请求失败");
        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .expect("读取响应失败");
        String::from_utf8_lossy(&response).into_owned()
    });

    let request = match requests.next().await {
        Some(Ok(ServerEvent::Request(request))) => request,
        other => panic!("期望请求事件，得到 {:?}", other),
    };
    let action = request.response.text("unix-ok", SendOptions::new());
    engine.send(FluxCommand::Send(action)).unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "响应: {}", response);
    assert!(response.ends_with("unix-ok"));

    engine.shutdown();
}
