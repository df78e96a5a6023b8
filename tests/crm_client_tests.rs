//! CRM client behavior: retry policy, the batch empty-input contract, and
//! chunking of coalesced finders.

mod test_utils;

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clinic_bridge::crm::CrmClient;
use clinic_bridge::error::BridgeError;
use test_utils::{contact_json, mount_batch, test_config, CONTACTS_BATCH, DEALS_BATCH};

async fn client(server: &MockServer) -> CrmClient {
    let dir = tempfile::tempdir().unwrap();
    CrmClient::new(&test_config(&server.uri(), dir.path()).crm).unwrap()
}

#[tokio::test]
async fn batch_finders_with_empty_input_make_no_http_calls() {
    let server = MockServer::start().await;
    let crm = client(&server).await;

    assert!(crm.batch_find_contacts_by_phones(&[]).await.unwrap().is_empty());
    assert!(crm
        .batch_find_deals_by_external_ids(&[])
        .await
        .unwrap()
        .is_empty());
    assert!(crm
        .batch_find_leads_by_contact_ids(&[])
        .await
        .unwrap()
        .is_empty());
    assert!(crm
        .batch_find_leads_by_phones(&[], &Default::default())
        .await
        .unwrap()
        .is_empty());

    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_up_to_the_attempt_budget() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/crm.deal.get"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "ID": "7", "STAGE_ID": "NEW" }
        })))
        .mount(&server)
        .await;

    let crm = client(&server).await;
    let deal = crm.get_deal(7).await.unwrap().unwrap();
    assert_eq!(deal.id, 7);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_the_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.get"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let crm = client(&server).await;
    let err = crm.get_deal(7).await.unwrap_err();
    assert!(matches!(err, BridgeError::CrmTransient(_)));
    // max_retries = 2 in the test config.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn validation_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.get"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad field"))
        .mount(&server)
        .await;

    let crm = client(&server).await;
    let err = crm.get_deal(7).await.unwrap_err();
    assert!(matches!(err, BridgeError::CrmValidation(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn crm_level_rate_limit_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "QUERY_LIMIT_EXCEEDED",
            "error_description": "slow down"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "ID": "7", "STAGE_ID": "NEW" }
        })))
        .mount(&server)
        .await;

    let crm = client(&server).await;
    assert!(crm.get_deal(7).await.unwrap().is_some());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn auth_rejection_is_a_validation_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let crm = client(&server).await;
    let record = test_utils::record(
        "F1_1",
        "+79991234567",
        clinic_bridge::source::AppointmentStatus::Planned,
    );
    let err = crm
        .create_contact(&clinic_bridge::crm::ContactFields::from_record(&record))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::CrmValidation(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn finders_chunk_inputs_by_fifty() {
    let server = MockServer::start().await;
    mount_batch(&server, DEALS_BATCH, json!({})).await;

    let crm = client(&server).await;
    let ids: Vec<String> = (0..60).map(|i| format!("F1_{i}")).collect();
    let found = crm.batch_find_deals_by_external_ids(&ids).await.unwrap();

    // Every requested key is present, all misses.
    assert_eq!(found.len(), 60);
    assert!(found.values().all(Option::is_none));
    // 60 ids → two HTTP calls.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn contact_finder_parses_first_match_per_phone() {
    let server = MockServer::start().await;
    mount_batch(
        &server,
        CONTACTS_BATCH,
        json!({ "+79991234567": [contact_json(42)] }),
    )
    .await;

    let crm = client(&server).await;
    let phones = vec!["+79991234567".to_string(), "+79990000000".to_string()];
    let found = crm.batch_find_contacts_by_phones(&phones).await.unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found["+79991234567"].as_ref().unwrap().id, 42);
    assert!(found["+79990000000"].is_none());
}

#[tokio::test]
async fn lead_finder_reuses_the_contacts_map() {
    let server = MockServer::start().await;
    mount_batch(
        &server,
        test_utils::LEADS_BATCH,
        json!({ "42": [test_utils::lead_json(9, "NEW")] }),
    )
    .await;

    let crm = client(&server).await;
    let phones = vec!["+79991234567".to_string(), "+79990000000".to_string()];
    let mut contacts = std::collections::HashMap::new();
    contacts.insert(
        "+79991234567".to_string(),
        Some(clinic_bridge::crm::Contact {
            id: 42,
            name: "Иван".to_string(),
            last_name: "Иванов".to_string(),
        }),
    );
    contacts.insert("+79990000000".to_string(), None);

    let leads = crm
        .batch_find_leads_by_phones(&phones, &contacts)
        .await
        .unwrap();
    assert_eq!(leads["+79991234567"].as_ref().unwrap().id, 9);
    assert!(leads["+79990000000"].is_none());
    // Only the lead lookup hit the wire; contacts came from the map.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_batch_is_rejected_client_side() {
    let server = MockServer::start().await;
    let crm = client(&server).await;
    let commands: Vec<(String, String)> = (0..51)
        .map(|i| (format!("c{i}"), "crm.contact.list".to_string()))
        .collect();
    let err = crm.batch(&commands).await.unwrap_err();
    assert!(matches!(err, BridgeError::CrmValidation(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn append_note_is_one_field_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.update"))
        .and(body_string_contains("UF_CRM_TREATMENT_PLAN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
        .expect(1)
        .mount(&server)
        .await;

    let crm = client(&server).await;
    crm.append_note(7, "2× Слепок — 2500.00\nИтого: 2500.00")
        .await
        .unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
