//! End-to-end tests: caller -> loopback relay channel -> engine -> target.

mod common;

use common::*;
use ikspoz::events::TunnelEvent;
use ikspoz::{ConnectionState, TargetClient};
use ikspoz_test_support::test_report;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_get_is_forwarded_without_relay_host() {
    let t = test_report!("GET /items?x=1 reaches the target with Accept and the target's Host");

    let target = TestTarget::start(echo_handler()).await;
    let tunnel = TestTunnel::start(&target.url()).await;
    t.setup(format!("Tunnel {} -> {}", tunnel.public_url, target.url()));

    t.action("GET /items?x=1 with Accept: application/json");
    let resp = test_client()
        .get(tunnel.url("items?x=1"))
        .header("Accept", "application/json")
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap();

    t.assert_eq("status", &status, &200u16);
    t.assert_contains("method", &body, "method=GET");
    t.assert_contains("path", &body, "path=/items\n");
    t.assert_contains("query", &body, "query=x=1\n");
    t.assert_contains("accept forwarded", &body, "accept: application/json");
    t.assert_contains(
        "host is the target",
        &body,
        &format!("host: {}", target.addr),
    );
    t.assert_true(
        "relay host not forwarded",
        !body.contains(&format!("host: {}", tunnel.relay_authority())),
    );

    tunnel.close().await;
    target.shutdown();
}

#[tokio::test]
async fn test_request_target_bytes_reach_target_unchanged() {
    let t = test_report!("Quotes, braces and dot segments pass through the tunnel as sent");

    let target = TestTarget::start(echo_handler()).await;
    let tunnel = TestTunnel::start(&target.url()).await;

    t.action("GET /ikspoz/a/{id}/./b/../c?name='bob' on a raw connection");
    let response = raw_get(
        &tunnel.relay_authority(),
        &format!("/{}/a/{{id}}/./b/../c?name='bob'", ENTITY),
    )
    .await;

    t.assert_eq("status", &status_line(&response), &"HTTP/1.1 200 OK");
    t.assert_contains("path", &response, "path=/a/{id}/./b/../c\n");
    t.assert_contains("query", &response, "query=name='bob'\n");

    tunnel.close().await;
    target.shutdown();
}

#[tokio::test]
async fn test_target_response_relayed_unchanged() {
    let t = test_report!("Status, Content-Type and body come back unchanged");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("x", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"a":1}"#, "application/json"))
        .mount(&server)
        .await;

    let target = url::Url::parse(&server.uri()).unwrap();
    let tunnel = TestTunnel::start(&target).await;

    t.action("GET /items?x=1 through the tunnel");
    let resp = test_client()
        .get(tunnel.url("items?x=1"))
        .send()
        .await
        .unwrap();

    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    t.assert_eq(
        "content-type",
        &resp.headers()["content-type"].to_str().unwrap(),
        &"application/json",
    );
    t.assert_eq("body", &resp.text().await.unwrap().as_str(), &r#"{"a":1}"#);

    let requests = server.received_requests().await.unwrap();
    t.assert_eq("target saw one request", &requests.len(), &1usize);
    let host = requests[0].headers.get("host").unwrap().to_str().unwrap();
    t.assert_eq(
        "host rewritten",
        &host.to_string(),
        &target.host_str().map(|h| format!("{}:{}", h, target.port().unwrap())).unwrap(),
    );

    tunnel.close().await;
}

#[tokio::test]
async fn test_post_body_streams_to_target() {
    let t = test_report!("Request bodies and content headers reach the target");

    let target = TestTarget::start(echo_handler()).await;
    let tunnel = TestTunnel::start(&target.url()).await;

    t.action("POST /submit with a JSON body");
    let resp = test_client()
        .post(tunnel.url("submit"))
        .header("Content-Type", "application/json")
        .header("X-Trace", "abc")
        .body(r#"{"name":"ikspoz"}"#)
        .send()
        .await
        .unwrap();
    let body = resp.text().await.unwrap();

    t.assert_contains("method", &body, "method=POST");
    t.assert_contains("content-type", &body, "content-type: application/json");
    t.assert_contains("content-length", &body, "content-length: 17");
    t.assert_contains("general header", &body, "x-trace: abc");
    t.assert_true("body", body.ends_with(r#"{"name":"ikspoz"}"#));

    tunnel.close().await;
    target.shutdown();
}

#[tokio::test]
async fn test_connection_refused_returns_error_tunneling_request() {
    let t = test_report!("An unreachable target yields 500 'ikspoz: Error tunneling request'");

    let target = dead_target().await;
    let mut tunnel =
        TestTunnel::start_with_client(&target, TargetClient::new().with_connect_timeout(Some(Duration::from_secs(2))))
            .await;

    t.action("GET / over a raw connection");
    let response = raw_get(&tunnel.relay_authority(), "/ikspoz/").await;
    t.assert_eq(
        "status line",
        &status_line(&response),
        &"HTTP/1.1 500 ikspoz: Error tunneling request",
    );

    let event = tunnel
        .wait_for(|e| matches!(e, TunnelEvent::RequestError { .. }))
        .await;
    if let TunnelEvent::RequestError { request, error } = event {
        t.assert_contains("request url", &request.url, &target.to_string());
        t.assert_contains("error", &error.to_string(), "Failed to connect");
    }

    tunnel.close().await;
}

#[tokio::test]
async fn test_close_mid_body_returns_tunnel_closing() {
    let t = test_report!("Closing while the body is pending yields 500 'ikspoz: Tunnel closing'");

    let target = TestTarget::start(stalled_body_handler()).await;
    let mut tunnel = TestTunnel::start(&target.url()).await;
    let authority = tunnel.relay_authority();

    t.action("Start a request whose body never arrives");
    let pending = tokio::spawn(async move { raw_get(&authority, "/ikspoz/download").await });
    tunnel
        .wait_for(|e| matches!(e, TunnelEvent::ResponseReceived { .. }))
        .await;

    t.action("Close the tunnel");
    tunnel.engine.close().await.unwrap();
    t.assert_eq("state", &tunnel.engine.state(), &ConnectionState::Closed);

    let response = pending.await.unwrap();
    t.assert_eq(
        "status line",
        &status_line(&response),
        &"HTTP/1.1 500 ikspoz: Tunnel closing",
    );
    t.assert_true(
        "no stale content-length",
        !response.to_ascii_lowercase().contains("content-length: 1024"),
    );

    target.shutdown();
}

#[tokio::test]
async fn test_zero_content_length_forwarded() {
    let t = test_report!("A zero-length target response keeps Content-Length: 0");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let tunnel = TestTunnel::start(&url::Url::parse(&server.uri()).unwrap()).await;
    let resp = test_client().get(tunnel.url("empty")).send().await.unwrap();

    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    t.assert_eq(
        "content-length",
        &resp
            .headers()
            .get("content-length")
            .map(|v| v.to_str().unwrap().to_string()),
        &Some("0".to_string()),
    );
    t.assert_true("empty body", resp.bytes().await.unwrap().is_empty());

    tunnel.close().await;
}

#[tokio::test]
async fn test_repeated_headers_preserved() {
    let t = test_report!("Repeated response headers keep every value in order");

    let target = TestTarget::start(multi_header_handler()).await;
    let tunnel = TestTunnel::start(&target.url()).await;

    let resp = test_client().get(tunnel.url("")).send().await.unwrap();
    let cookies: Vec<_> = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    let languages: Vec<_> = resp
        .headers()
        .get_all("content-language")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();

    t.assert_eq("cookies", &cookies, &vec!["a=1".to_string(), "b=2".to_string()]);
    t.assert_eq("languages", &languages, &vec!["en".to_string(), "fr".to_string()]);

    tunnel.close().await;
    target.shutdown();
}

#[tokio::test]
async fn test_reason_phrase_relayed() {
    let t = test_report!("The target's reason phrase reaches the caller");

    let target = TestTarget::start(reason_handler(299, "Mostly Fine")).await;
    let tunnel = TestTunnel::start(&target.url()).await;

    let response = raw_get(&tunnel.relay_authority(), "/ikspoz/").await;
    t.assert_eq(
        "status line",
        &status_line(&response),
        &"HTTP/1.1 299 Mostly Fine",
    );

    tunnel.close().await;
    target.shutdown();
}

#[tokio::test]
async fn test_per_request_events_in_order() {
    let t = test_report!("A request fires received, forwarded, then response received");

    let target = TestTarget::start(ok_handler("text/plain", "hello")).await;
    let mut tunnel = TestTunnel::start(&target.url()).await;

    let mut names = Vec::new();
    while let Some(event) = tunnel.events.try_recv() {
        names.push(event.name());
    }
    t.assert_eq("open events", &names, &vec!["connecting", "connected"]);

    test_client().get(tunnel.url("hello")).send().await.unwrap();

    let received = tunnel.wait_for(|_| true).await;
    let forwarded = tunnel.wait_for(|_| true).await;
    let responded = tunnel.wait_for(|_| true).await;
    t.assert_eq("first", &received.name(), &"request_received");
    t.assert_eq("second", &forwarded.name(), &"request_forwarded");
    t.assert_eq("third", &responded.name(), &"response_received");

    if let TunnelEvent::RequestForwarded { request } = forwarded {
        t.assert_eq(
            "forwarded url",
            &request.url,
            &format!("http://{}/hello", target.addr),
        );
    }
    if let TunnelEvent::ResponseReceived { response, .. } = responded {
        t.assert_eq("status", &response.status.as_u16(), &200u16);
        t.assert_eq("length", &response.content_length, &Some(5u64));
    }

    tunnel.close().await;
    target.shutdown();
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let t = test_report!("Concurrent requests are tunneled independently");

    let target = TestTarget::start(echo_handler()).await;
    let tunnel = TestTunnel::start(&target.url()).await;
    let client = test_client();

    t.action("Send 8 requests at once");
    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        let url = tunnel.url(&format!("item/{}", i));
        handles.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().text().await.unwrap()
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let body = handle.await.unwrap();
        t.assert_contains(&format!("request {}", i), &body, &format!("path=/item/{}\n", i));
    }

    tunnel.close().await;
    target.shutdown();
}
