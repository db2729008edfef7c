use chrono::Utc;
use serde_json::json;
use axum::http::HeaderMap;
use tarpit::request::{Headers, IncomingRequest, Method, RawRequest};
use tarpit::scoring::{ClassifierConfig, ThreatClassifier};

fn request(method: Method, path: &str) -> IncomingRequest {
    IncomingRequest {
        address: "198.51.100.77".into(),
        method,
        path: path.into(),
        query_string: None,
        headers: Headers::new(),
        body: None,
        local_port: 80,
        timestamp: Utc::now(),
    }
}

fn with_agent(mut req: IncomingRequest, agent: &str) -> IncomingRequest {
    req.headers.insert("user-agent".into(), agent.into());
    req
}

#[test]
fn allow_listed_gets_score_one() {
    let classifier = ThreatClassifier::default();
    for path in ["/", "/robots.txt"] {
        let req = request(Method::Get, path);
        assert!(req.is_acceptable());
        assert_eq!(classifier.classify(&req), 1, "{path}");
        let browser = with_agent(req, "Mozilla/5.0 (X11; Linux x86_64)");
        assert_eq!(classifier.classify(&browser), 1, "{path}");
    }
}

#[test]
fn sensitive_names_score_maximum_regardless_of_the_rest() {
    let classifier = ThreatClassifier::default();
    for path in ["/wp-config.php", "/.env", "/old/backup.sql", "/app/config.yml", "/secrets.json"] {
        let mut quiet = with_agent(request(Method::Head, path), "Mozilla/5.0");
        assert_eq!(classifier.classify(&quiet), 10, "{path}");
        quiet.method = Method::Post;
        quiet.body = Some(json!({"a": 1}));
        assert_eq!(classifier.classify(&quiet), 10, "{path}");
    }
}

#[test]
fn scanner_agent_short_circuits() {
    let classifier = ThreatClassifier::default();
    let req = with_agent(request(Method::Get, "/"), "Mozilla/5.0 (compatible; Nmap Scripting Engine)");
    let trace = classifier.classify_with_trace(&req);
    assert_eq!(trace.threat_level, 10);
    assert_eq!(trace.short_circuit, Some("user_agent"));
    assert_eq!(trace.sub_scores.len(), 1);
}

#[test]
fn extra_signatures_and_files_are_honoured() {
    let classifier = ThreatClassifier::new(&ClassifierConfig {
        extra_scanner_signatures: vec!["CensysInspect".into()],
        extra_sensitive_files: vec!["terraform.tfstate".into()],
    });
    let bot = with_agent(request(Method::Get, "/"), "Mozilla/5.0 (compatible; censysinspect/1.1)");
    assert_eq!(classifier.classify(&bot), 10);
    let state = with_agent(request(Method::Get, "/infra/terraform.tfstate"), "curl/8.0");
    assert_eq!(classifier.classify(&state), 10);
}

#[test]
fn post_with_json_body_lands_in_upper_middle() {
    let classifier = ThreatClassifier::default();
    let mut req = request(Method::Post, "/api/widgets");
    req.body = Some(json!({"x": 1}));

    // user_agent 10 + method 10 + uri 7 + query 5 + body 10 = 42 / 5
    let trace = classifier.classify_with_trace(&req);
    assert_eq!(trace.threat_level, 8);
    assert!(trace.short_circuit.is_none());
    assert_eq!(
        trace.sub_scores,
        vec![("user_agent", 10), ("method", 10), ("uri", 7), ("query", 5), ("body", 10)]
    );

    let with_browser = with_agent(req, "Mozilla/5.0");
    assert_eq!(classifier.classify(&with_browser), 7);
}

#[test]
fn scoring_table_for_plain_requests() {
    let classifier = ThreatClassifier::default();
    // 5 + 6 + 7 + 5 + 5 = 28 / 5 = 5.6
    let get = with_agent(request(Method::Get, "/index.html"), "Mozilla/5.0");
    assert_eq!(classifier.classify(&get), 6);

    // 10 + 7 + 7 + 10 + 5 = 39 / 5 = 7.8
    let mut odd = request(Method::Other, "/search");
    odd.query_string = Some("q=1".into());
    assert_eq!(classifier.classify(&odd), 8);

    // 5 + 8 + 7 + 5 + 5 = 30 / 5 = 6
    let pri = with_agent(request(Method::Pri, "*"), "h2c-probe");
    assert_eq!(classifier.classify(&pri), 6);
}

#[test]
fn mean_rounds_to_nearest() {
    let classifier = ThreatClassifier::default();
    // 5 + 8 + 7 + 10 + 5 = 35 / 5 = 7
    let mut delete = with_agent(request(Method::Delete, "/items/1"), "Mozilla/5.0");
    delete.query_string = Some("soft=0".into());
    assert_eq!(classifier.classify(&delete), 7);
    // 5 + 6 + 7 + 10 + 5 = 33 / 5 = 6.6
    let mut get = with_agent(request(Method::Get, "/items/1"), "Mozilla/5.0");
    get.query_string = Some("soft=0".into());
    assert_eq!(classifier.classify(&get), 7);
    // 5 + 6 + 7 + 5 + 5 = 28 / 5 = 5.6
    let head = with_agent(request(Method::Head, "/items/1"), "Mozilla/5.0");
    assert_eq!(classifier.classify(&head), 6);
    // 5 + 6 + 7 + 5 + 10 = 33 / 5 = 6.6
    let mut options = with_agent(request(Method::Options, "/items/1"), "Mozilla/5.0");
    options.body = Some(json!("x"));
    assert_eq!(classifier.classify(&options), 7);
    // An empty body container does not count as a payload.
    options.body = Some(json!({}));
    assert_eq!(classifier.classify(&options), 6);
}

#[test]
fn classification_is_deterministic() {
    let classifier = ThreatClassifier::default();
    let mut req = request(Method::Put, "/upload");
    req.body = Some(json!(["payload"]));
    let first = classifier.classify_with_trace(&req);
    for _ in 0..10 {
        assert_eq!(classifier.classify_with_trace(&req), first);
    }
}

#[test]
fn percent_encoded_sensitive_names_still_score_maximum() {
    let classifier = ThreatClassifier::default();
    let headers = HeaderMap::new();
    for (raw_path, decoded) in [
        ("/%2eenv", "/.env"),
        ("/wp%2Dconfig.php", "/wp-config.php"),
        ("/backup/%2E%67it/HEAD", "/backup/.git/HEAD"),
    ] {
        let req = IncomingRequest::from_raw(RawRequest {
            method: "GET",
            remote_addr: "198.51.100.77",
            path: raw_path,
            query: None,
            headers: &headers,
            body: b"",
            local_port: 80,
        });
        assert_eq!(req.path, decoded);
        assert_eq!(classifier.classify(&req), 10, "{raw_path}");
    }
}
