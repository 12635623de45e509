//! End-to-end tests: downstream client → proxy → mock upstream servers.

use std::time::Duration;

use serde_json::{json, Value};

mod common;

use common::{start_mock_upstream, start_proxy, Client, MOCK_SESSION_ID};

fn names(list: &Value, key: &str) -> Vec<String> {
    let mut names: Vec<String> = list["result"][key]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_aggregates_two_upstreams() {
    let alpha = start_mock_upstream("alpha", false).await;
    let beta = start_mock_upstream("beta", true).await;

    let proxy = start_proxy(json!({
        "mcpServers": {
            "alpha": {"url": alpha.url()},
            "beta": {"url": beta.url(), "transport": "streamable-http"}
        }
    }))
    .await;

    let mut client = Client::new(proxy.endpoint());
    let init = client.initialize().await;
    assert_eq!(init["result"]["serverInfo"]["name"], "Bango29 MCP Proxy");
    assert_eq!(init["result"]["protocolVersion"], "2025-06-18");

    let tools = client.call("tools/list", json!({})).await;
    assert_eq!(names(&tools, "tools"), vec!["alpha_echo", "beta_echo"]);

    let result = client
        .call("tools/call", json!({"name": "beta_echo", "arguments": {"x": 1}}))
        .await;
    assert_eq!(result["result"]["content"][0]["text"], r#"beta:echo:{"x":1}"#);

    let prompts = client.call("prompts/list", json!({})).await;
    assert_eq!(names(&prompts, "prompts"), vec!["alpha_greet", "beta_greet"]);
    let prompt = client.call("prompts/get", json!({"name": "alpha_greet"})).await;
    assert_eq!(
        prompt["result"]["messages"][0]["content"]["text"],
        "hello from alpha"
    );

    let resources = client.call("resources/list", json!({})).await;
    let uris: Vec<&str> = resources["result"]["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert!(uris.contains(&"mock://alpha/readme"));
    assert!(uris.contains(&"mock://beta/readme"));

    let read = client
        .call("resources/read", json!({"uri": "mock://beta/readme"}))
        .await;
    assert_eq!(read["result"]["contents"][0]["text"], "readme of beta");

    let unknown = client.call("tools/call", json!({"name": "gamma_echo"})).await;
    assert_eq!(unknown["error"]["code"], -32602);

    proxy.stop().await;

    // The upstream session id is echoed back after the handshake.
    let calls = alpha.recorder.lock().unwrap().calls.clone();
    assert_eq!(calls[0], ("initialize".to_string(), None));
    assert_eq!(calls[1].0, "notifications/initialized");
    assert!(calls[1..]
        .iter()
        .all(|(_, session)| session.as_deref() == Some(MOCK_SESSION_ID)));
    assert!(beta.methods().contains(&"resources/read".to_string()));
    assert!(!alpha.methods().contains(&"resources/read".to_string()));
}

#[tokio::test]
async fn test_expired_upstream_session_is_reinitialized() {
    let only = start_mock_upstream("only", false).await;
    let proxy = start_proxy(json!({"mcpServers": {"only": {"url": only.url()}}})).await;

    let mut client = Client::new(proxy.endpoint());
    client.initialize().await;
    client.call("tools/list", json!({})).await;

    only.recorder.lock().unwrap().expire_session = true;
    let result = client.call("tools/call", json!({"name": "echo", "arguments": {}})).await;
    assert_eq!(result["result"]["content"][0]["text"], "only:echo:{}");

    let methods = only.methods();
    assert_eq!(methods.iter().filter(|m| *m == "initialize").count(), 2);
    assert_eq!(methods.iter().filter(|m| *m == "tools/call").count(), 2);

    proxy.stop().await;
}

#[tokio::test]
async fn test_resource_completion_routed_before_listing() {
    let alpha = start_mock_upstream("alpha", false).await;
    let beta = start_mock_upstream("beta", false).await;
    let proxy = start_proxy(json!({
        "mcpServers": {"alpha": {"url": alpha.url()}, "beta": {"url": beta.url()}}
    }))
    .await;

    let mut client = Client::new(proxy.endpoint());
    client.initialize().await;

    let completion = client
        .call(
            "completion/complete",
            json!({
                "ref": {"type": "ref/resource", "uri": "mock://beta/readme"},
                "argument": {"name": "section", "value": ""}
            }),
        )
        .await;
    assert_eq!(completion["result"]["completion"]["values"], json!(["beta"]));

    // The owner learned by completion also serves reads without probing alpha again.
    let read = client.call("resources/read", json!({"uri": "mock://beta/readme"})).await;
    assert_eq!(read["result"]["contents"][0]["text"], "readme of beta");
    assert_eq!(
        alpha.methods().iter().filter(|m| m.as_str() == "completion/complete").count(),
        1
    );
    assert!(!alpha.methods().contains(&"resources/read".to_string()));

    proxy.stop().await;
}

#[tokio::test]
async fn test_single_upstream_names_pass_through() {
    let only = start_mock_upstream("only", false).await;
    let proxy = start_proxy(json!({"mcpServers": {"only": {"url": only.url()}}})).await;

    let mut client = Client::new(proxy.endpoint());
    client.initialize().await;

    let tools = client.call("tools/list", json!({})).await;
    assert_eq!(names(&tools, "tools"), vec!["echo"]);

    let result = client.call("tools/call", json!({"name": "echo", "arguments": {}})).await;
    assert_eq!(result["result"]["content"][0]["text"], "only:echo:{}");

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_is_skipped_in_listings() {
    let live = start_mock_upstream("live", false).await;
    let proxy = start_proxy(json!({
        "mcpServers": {
            "live": {"url": live.url()},
            "dead": {"url": "http://127.0.0.1:9/mcp"}
        }
    }))
    .await;

    let mut client = Client::new(proxy.endpoint());
    client.initialize().await;

    let tools = client.call("tools/list", json!({})).await;
    assert_eq!(names(&tools, "tools"), vec!["live_echo"]);

    let failed = client.call("tools/call", json!({"name": "dead_echo"})).await;
    assert_eq!(failed["error"]["code"], -32603);
    assert!(failed["error"]["message"].as_str().unwrap().contains("dead"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_session_rules_over_the_wire() {
    let proxy = start_proxy(json!({"mcpServers": {}})).await;
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});

    let response = http.post(proxy.endpoint()).json(&ping).send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .post(proxy.endpoint())
        .header("mcp-session-id", "not-a-session")
        .json(&ping)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let mut client = Client::new(proxy.endpoint());
    client.initialize().await;
    let session = client.session_id.clone().unwrap();

    let response = client
        .post(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;
    assert_eq!(response.status(), 202);
    assert!(response.text().await.unwrap().is_empty());

    let response = http.get(proxy.endpoint()).send().await.unwrap();
    assert_eq!(response.status(), 405);

    let health: Value = http
        .get(format!("http://{}/health", proxy.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sessions"], 1);

    let response = http
        .delete(proxy.endpoint())
        .header("mcp-session-id", &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client.post(ping).await;
    assert_eq!(response.status(), 404);

    proxy.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_stdio_upstream() {
    let proxy = start_proxy(json!({
        "mcpServers": {
            "shell": {"command": "sh", "args": ["-c", common::SH_MCP_SERVER]}
        }
    }))
    .await;

    let mut client = Client::new(proxy.endpoint());
    client.initialize().await;

    let tools = tokio::time::timeout(Duration::from_secs(10), client.call("tools/list", json!({})))
        .await
        .unwrap();
    assert_eq!(names(&tools, "tools"), vec!["hello"]);

    let result = client.call("tools/call", json!({"name": "hello", "arguments": {}})).await;
    assert_eq!(result["result"]["content"][0]["text"], "hello from sh");

    let missing = client.call("completion/complete", json!({
        "ref": {"type": "ref/prompt", "name": "nothing"},
        "argument": {"name": "a", "value": ""}
    }))
    .await;
    assert!(missing.get("error").is_some());

    proxy.stop().await;
}
