//! PowerDNS adapter against a mock HTTP API.

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dns_reconciler::{
    domain_filter::DomainFilter,
    endpoint::{Changes, Endpoint, RecordType},
    pdns::{PdnsClient, PdnsProvider},
    provider::Provider,
};

const ZONE_PATH: &str = "/api/v1/servers/localhost/zones/example.com.";

async fn provider(server: &MockServer) -> PdnsProvider {
    let client = PdnsClient::new(&server.uri(), "secret", "localhost").unwrap();
    PdnsProvider::new(client, "example.com", 300)
}

fn zone_body() -> Value {
    json!({
        "rrsets": [
            {"name": "example.com.", "type": "SOA", "ttl": 3600,
             "records": [{"content": "ns1.example.com. hostmaster.example.com. 1 10800 3600 604800 3600", "disabled": false}]},
            {"name": "www.example.com.", "type": "A", "ttl": 300,
             "records": [{"content": "10.0.0.1", "disabled": false}, {"content": "10.0.0.2", "disabled": false}]},
            {"name": "alias.example.com.", "type": "CNAME", "ttl": 60,
             "records": [{"content": "lb.example.net.", "disabled": false}]},
            {"name": "a-www.example.com.", "type": "TXT", "ttl": 300,
             "records": [{"content": "\"heritage=external-dns,external-dns/owner=default\"", "disabled": false}]},
            {"name": "off.example.com.", "type": "A", "ttl": 300,
             "records": [{"content": "10.9.9.9", "disabled": true}]}
        ]
    })
}

#[tokio::test]
async fn reads_zone_into_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ZONE_PATH))
        .and(header("X-API-Key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(zone_body()))
        .mount(&server)
        .await;

    let records = provider(&server).await.records().await.unwrap();

    assert_eq!(records.len(), 3, "{records:?}");
    let www = records.iter().find(|ep| ep.dns_name == "www.example.com").unwrap();
    assert_eq!(www.record_type, RecordType::A);
    assert_eq!(www.targets, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(www.record_ttl, Some(300));

    let alias = records.iter().find(|ep| ep.dns_name == "alias.example.com").unwrap();
    assert_eq!(alias.targets, vec!["lb.example.net"]);

    let txt = records.iter().find(|ep| ep.record_type == RecordType::Txt).unwrap();
    assert_eq!(txt.targets, vec!["heritage=external-dns,external-dns/owner=default"]);
}

#[tokio::test]
async fn https_records_read_back_as_written() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ZONE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rrsets": [
                {"name": "svc.example.com.", "type": "HTTPS", "ttl": 300,
                 "records": [{"content": "1 lb.example.com. alpn=h2", "disabled": false}]}
            ]
        })))
        .mount(&server)
        .await;

    let records = provider(&server).await.records().await.unwrap();
    let desired = Endpoint::new("svc.example.com", RecordType::Https, ["1 lb.example.com alpn=h2"]);
    assert_eq!(records.len(), 1);
    assert!(records[0].same_targets(&desired), "{:?}", records[0].targets);
}

#[tokio::test]
async fn server_error_fails_the_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ZONE_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(provider(&server).await.records().await.is_err());
}

#[tokio::test]
async fn changes_are_sent_as_one_patch() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(ZONE_PATH))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let old_alias = Endpoint::new("alias.example.com", RecordType::Cname, ["lb.example.net"]);
    let swapped = Endpoint::new("swap.example.com", RecordType::A, ["10.0.0.5"]);
    let changes = Changes {
        create: vec![
            Endpoint::new("new.example.com", RecordType::A, ["10.0.0.3"]).with_ttl(120),
            Endpoint::new("new.example.com", RecordType::Txt, ["hello world"]),
            swapped.clone(),
        ],
        update_old: vec![old_alias],
        update_new: vec![Endpoint::new("alias.example.com", RecordType::Cname, ["lb2.example.net"])],
        delete: vec![
            Endpoint::new("gone.example.com", RecordType::A, ["10.0.0.4"]),
            swapped,
        ],
    };

    provider(&server).await.apply_changes(&changes).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let rrsets = body["rrsets"].as_array().unwrap();
    assert_eq!(rrsets.len(), 5, "{body:#}");

    let find = |name: &str, rtype: &str| {
        rrsets
            .iter()
            .find(|r| r["name"] == name && r["type"] == rtype)
            .unwrap_or_else(|| panic!("{rtype} {name} missing from {body:#}"))
    };

    let gone = find("gone.example.com.", "A");
    assert_eq!(gone["changetype"], "DELETE");

    let alias = find("alias.example.com.", "CNAME");
    assert_eq!(alias["changetype"], "REPLACE");
    assert_eq!(alias["records"][0]["content"], "lb2.example.net.");
    assert_eq!(alias["ttl"], 300);

    let new_a = find("new.example.com.", "A");
    assert_eq!(new_a["ttl"], 120);
    assert_eq!(new_a["records"][0]["content"], "10.0.0.3");

    let new_txt = find("new.example.com.", "TXT");
    assert_eq!(new_txt["records"][0]["content"], "\"hello world\"");

    // Replaced in place rather than deleted and recreated.
    let swap = find("swap.example.com.", "A");
    assert_eq!(swap["changetype"], "REPLACE");
}

#[tokio::test]
async fn empty_batch_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    provider(&server).await.apply_changes(&Changes::default()).await.unwrap();
}

#[tokio::test]
async fn set_identifiers_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let changes = Changes {
        create: vec![Endpoint::new("w.example.com", RecordType::A, ["10.0.0.1"]).with_set_identifier("eu")],
        ..Changes::default()
    };
    assert!(provider(&server).await.apply_changes(&changes).await.is_err());
}

#[tokio::test]
async fn rejected_patch_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(ZONE_PATH))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"error": "RRset duplicate"})))
        .mount(&server)
        .await;

    let changes = Changes {
        create: vec![Endpoint::new("w.example.com", RecordType::A, ["10.0.0.1"])],
        ..Changes::default()
    };
    let err = provider(&server).await.apply_changes(&changes).await.unwrap_err();
    assert!(err.to_string().contains("422"), "{err}");
}

#[tokio::test]
async fn zones_are_discovered_through_the_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/servers/localhost/zones"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "example.com.", "name": "example.com."},
            {"id": "dev.example.com.", "name": "dev.example.com."},
            {"id": "example.org.", "name": "example.org."}
        ])))
        .mount(&server)
        .await;

    let client = PdnsClient::new(&server.uri(), "secret", "localhost").unwrap();

    let all = client.discover_zones(&DomainFilter::all()).await.unwrap();
    assert_eq!(all, vec!["dev.example.com", "example.com", "example.org"]);

    let filter = DomainFilter::new(&["example.com".to_string()], &[]).unwrap();
    assert_eq!(
        client.discover_zones(&filter).await.unwrap(),
        vec!["dev.example.com", "example.com"]
    );

    // A single name selects the zone that hosts it.
    let filter = DomainFilter::new(&["www.example.org".to_string()], &[]).unwrap();
    assert_eq!(client.discover_zones(&filter).await.unwrap(), vec!["example.org"]);
}
