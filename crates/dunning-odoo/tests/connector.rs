use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use dunning_core::FetchOutcome;
use dunning_odoo::{ConnectorConfig, OdooConnector, OdooError, OdooRpc};
use serde_json::{json, Value};

/// In-memory Odoo that counts calls and can be told to stall or fail.
#[derive(Default)]
struct FakeOdoo {
    invoices: Value,
    records: HashMap<&'static str, Vec<Value>>,
    delays: HashMap<&'static str, Duration>,
    failing_models: Vec<&'static str>,
    reject_auth: bool,
    fail_search: bool,
    expire_session_once: AtomicBool,
    auth_calls: AtomicUsize,
    reads: Mutex<Vec<(String, Vec<i64>)>>,
    reports: Mutex<Vec<(String, Vec<i64>)>>,
}

impl FakeOdoo {
    fn standard() -> Self {
        let mut records = HashMap::new();
        records.insert(
            "res.partner",
            vec![
                json!({"id": 10, "name": "Acme Corp", "email": "ap@acme.test"}),
                json!({"id": 11, "name": "Globex", "email": false}),
            ],
        );
        records.insert(
            "res.currency",
            vec![json!({"id": 2, "name": "AED", "symbol": "AED"})],
        );
        records.insert(
            "res.company",
            vec![json!({"id": 1, "name": "Prezlab FZ LLC"})],
        );
        Self {
            invoices: json!([
                invoice(3, "PLFZ/2024/003", 10, json!([1, "Prezlab FZ LLC"]), 900.0, 900.0, "2024-01-01"),
                invoice(1, "PLAD/2024/001", 11, json!(false), 300.0, 120.0, "2024-02-05"),
                invoice(2, "INV/2024/002", 10, json!([1, "Prezlab FZ LLC"]), 50.0, 50.0, "2024-02-10"),
            ]),
            records,
            ..Self::default()
        }
    }

    fn read_log(&self) -> Vec<(String, Vec<i64>)> {
        self.reads.lock().unwrap().clone()
    }

    fn reads_of(&self, model: &str) -> usize {
        self.read_log().iter().filter(|(m, _)| m == model).count()
    }
}

fn invoice(
    id: i64,
    name: &str,
    partner: i64,
    company: Value,
    total: f64,
    residual: f64,
    due: &str,
) -> Value {
    json!({
        "id": id,
        "name": name,
        "partner_id": [partner, "display"],
        "amount_total": total,
        "amount_residual": residual,
        "invoice_date": "2023-12-01",
        "invoice_date_due": due,
        "payment_state": "not_paid",
        "currency_id": [2, "AED"],
        "company_id": company,
        "invoice_origin": false
    })
}

#[async_trait]
impl OdooRpc for FakeOdoo {
    async fn authenticate(&self) -> Result<i64, OdooError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth {
            return Err(OdooError::AuthenticationRejected {
                database: "test".into(),
                login: "bot".into(),
            });
        }
        Ok(2)
    }

    async fn call_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        _kwargs: Value,
    ) -> Result<Value, OdooError> {
        if self.expire_session_once.swap(false, Ordering::SeqCst) {
            return Err(OdooError::SessionExpired);
        }
        match method {
            "search_read" => {
                if self.fail_search {
                    return Err(OdooError::Rpc {
                        message: "Access Denied".into(),
                    });
                }
                Ok(self.invoices.clone())
            }
            "read" => {
                let ids: Vec<i64> = serde_json::from_value(args[0].clone()).unwrap();
                self.reads
                    .lock()
                    .unwrap()
                    .push((model.to_string(), ids.clone()));
                if let Some(delay) = self.delays.get(model) {
                    tokio::time::sleep(*delay).await;
                }
                if self.failing_models.iter().any(|m| *m == model) {
                    return Err(OdooError::HttpStatus {
                        status: 502,
                        url: "http://fake/web/dataset/call_kw".into(),
                    });
                }
                let rows = self
                    .records
                    .get(model)
                    .map(|rows| {
                        rows.iter()
                            .filter(|row| ids.contains(&row["id"].as_i64().unwrap()))
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                Ok(Value::Array(rows))
            }
            other => panic!("unexpected method {other}"),
        }
    }

    async fn download_report(&self, report: &str, ids: &[i64]) -> Result<Vec<u8>, OdooError> {
        if self.expire_session_once.swap(false, Ordering::SeqCst) {
            return Err(OdooError::SessionExpired);
        }
        self.reports
            .lock()
            .unwrap()
            .push((report.to_string(), ids.to_vec()));
        Ok(b"%PDF-1.7".to_vec())
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()
}

fn connector(fake: &Arc<FakeOdoo>) -> OdooConnector {
    OdooConnector::new(fake.clone(), ConnectorConfig::default())
}

#[tokio::test]
async fn fetch_enriches_records_in_remote_order() {
    let fake = Arc::new(FakeOdoo::standard());
    let records = connector(&fake)
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch");

    let numbers: Vec<_> = records.iter().map(|r| r.invoice_number.as_str()).collect();
    assert_eq!(numbers, ["PLFZ/2024/003", "PLAD/2024/001", "INV/2024/002"]);

    assert_eq!(records[0].client_name, "Acme Corp");
    assert_eq!(records[0].client_email, "ap@acme.test");
    assert_eq!(records[0].company_name, "Prezlab FZ LLC");
    assert_eq!(records[0].currency_symbol, "AED");
    assert_eq!(records[0].days_overdue, 40);

    assert_eq!(records[1].client_name, "Globex");
    assert!(!records[1].has_email());
    assert_eq!(records[1].company_name, "Prezlab Advanced Design Company");
    assert_eq!(records[1].amount_due, 120.0);
    assert_eq!(records[1].days_overdue, 5);

    assert_eq!(records[2].days_overdue, 0);
}

#[tokio::test]
async fn distinct_ids_are_read_once_per_model() {
    let fake = Arc::new(FakeOdoo::standard());
    connector(&fake)
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch");

    let log = fake.read_log();
    let partner_ids = log
        .iter()
        .find(|(model, _)| model == "res.partner")
        .map(|(_, ids)| ids.clone())
        .unwrap();
    assert_eq!(partner_ids, vec![10, 11]);
    assert_eq!(fake.reads_of("res.currency"), 1);
    assert_eq!(fake.reads_of("res.company"), 1);
}

#[tokio::test]
async fn non_positive_amounts_never_surface() {
    let fake = Arc::new(FakeOdoo {
        invoices: json!([
            invoice(1, "INV/1", 10, json!(false), 0.0, 10.0, "2024-02-01"),
            invoice(2, "INV/2", 11, json!(false), 100.0, -5.0, "2024-02-01"),
            invoice(3, "INV/3", 10, json!(false), 100.0, 25.0, "2024-02-01"),
        ]),
        ..FakeOdoo::standard()
    });
    let records = connector(&fake)
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, 3);
    let partner_reads: Vec<_> = fake
        .read_log()
        .into_iter()
        .filter(|(model, _)| model == "res.partner")
        .collect();
    assert_eq!(partner_reads[0].1, vec![10]);
}

#[tokio::test(start_paused = true)]
async fn cache_is_reused_within_ttl_and_refreshed_after() {
    let fake = Arc::new(FakeOdoo::standard());
    let connector = connector(&fake);

    let first = connector.lookup_partners(&[10, 11]).await.expect("lookup");
    let second = connector.lookup_partners(&[10, 11]).await.expect("lookup");
    assert_eq!(first, second);
    assert_eq!(fake.reads_of("res.partner"), 1);
    assert!(connector.cache().is_valid().await);

    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(!connector.cache().is_valid().await);

    connector.lookup_partners(&[10, 11]).await.expect("lookup");
    assert_eq!(fake.reads_of("res.partner"), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_rereads_every_entity_kind_on_next_fetch() {
    let fake = Arc::new(FakeOdoo::standard());
    let connector = connector(&fake);

    connector
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("first fetch");
    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(!connector.cache().is_valid().await);

    let records = connector
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("second fetch");

    for model in ["res.partner", "res.currency", "res.company"] {
        assert_eq!(fake.reads_of(model), 2, "{model} served from an expired cache");
    }
    assert_eq!(records[0].currency_symbol, "AED");
    assert_eq!(records[0].company_name, "Prezlab FZ LLC");
    assert!(connector.cache().is_valid().await);
}

#[tokio::test]
async fn partial_cache_hit_only_reads_missing_ids() {
    let fake = Arc::new(FakeOdoo::standard());
    let connector = connector(&fake);

    connector.lookup_partners(&[10]).await.expect("lookup");
    let both = connector.lookup_partners(&[10, 11]).await.expect("lookup");

    assert_eq!(both.len(), 2);
    assert_eq!(both[&10].name.as_deref(), Some("Acme Corp"));
    assert_eq!(both[&11].name.as_deref(), Some("Globex"));
    let log = fake.read_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].1, vec![11]);
}

#[tokio::test]
async fn empty_id_sets_skip_the_remote() {
    let fake = Arc::new(FakeOdoo::standard());
    let companies = connector(&fake).lookup_companies(&[]).await.expect("lookup");
    assert!(companies.is_empty());
    assert!(fake.read_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_lookup_times_out_and_degrades() {
    let mut fake = FakeOdoo::standard();
    fake.delays
        .insert("res.currency", Duration::from_secs(30));
    let fake = Arc::new(fake);

    let started = tokio::time::Instant::now();
    let records = connector(&fake)
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch");

    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(records.iter().all(|r| r.currency_symbol == "$"));
    assert_eq!(records[0].client_name, "Acme Corp");
    assert_eq!(records[0].company_name, "Prezlab FZ LLC");
}

#[tokio::test(start_paused = true)]
async fn lookups_run_concurrently() {
    let mut fake = FakeOdoo::standard();
    for model in ["res.partner", "res.currency", "res.company"] {
        fake.delays.insert(model, Duration::from_secs(4));
    }
    let fake = Arc::new(fake);

    let started = tokio::time::Instant::now();
    connector(&fake)
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed < Duration::from_secs(8));
}

#[tokio::test]
async fn failed_company_lookup_falls_back_to_unknown_company() {
    let fake = Arc::new(FakeOdoo {
        failing_models: vec!["res.company"],
        ..FakeOdoo::standard()
    });
    let records = connector(&fake)
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch");

    // Row carries a company id the lookup could not resolve.
    assert_eq!(records[0].company_name, "Unknown Company");
    // Row without a company id still uses its invoice-number prefix.
    assert_eq!(records[1].company_name, "Prezlab Advanced Design Company");
    assert_eq!(records[0].client_name, "Acme Corp");
}

#[tokio::test]
async fn failed_partner_lookup_leaves_unknown_clients() {
    let fake = Arc::new(FakeOdoo {
        failing_models: vec!["res.partner"],
        ..FakeOdoo::standard()
    });
    let outcome = connector(&fake).fetch_overdue_invoices(None).await;
    let records = outcome.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.client_name == "Unknown" && r.client_email.is_empty()));
}

#[tokio::test]
async fn rejected_authentication_is_a_failed_outcome() {
    let fake = Arc::new(FakeOdoo {
        reject_auth: true,
        ..FakeOdoo::standard()
    });
    let outcome = connector(&fake).fetch_overdue_invoices(None).await;
    assert!(outcome.is_failure());
    assert!(fake.read_log().is_empty());
}

#[tokio::test]
async fn search_error_is_a_failed_outcome() {
    let fake = Arc::new(FakeOdoo {
        fail_search: true,
        ..FakeOdoo::standard()
    });
    match connector(&fake).fetch_overdue_invoices(None).await {
        FetchOutcome::Failed { reason } => assert!(reason.contains("Access Denied")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_search_is_none_overdue() {
    let fake = Arc::new(FakeOdoo {
        invoices: json!([]),
        ..FakeOdoo::standard()
    });
    assert_eq!(
        connector(&fake).fetch_overdue_invoices(None).await,
        FetchOutcome::NoneOverdue
    );
}

#[tokio::test]
async fn malformed_row_fails_the_whole_fetch() {
    let fake = Arc::new(FakeOdoo {
        invoices: json!([
            invoice(1, "INV/1", 10, json!(false), 10.0, 10.0, "2024-02-01"),
            {"id": 2, "name": "INV/2", "amount_total": "lots"}
        ]),
        ..FakeOdoo::standard()
    });
    assert!(connector(&fake).fetch_overdue_invoices(None).await.is_failure());
}

#[tokio::test]
async fn session_is_authenticated_once() {
    let fake = Arc::new(FakeOdoo::standard());
    let connector = connector(&fake);

    connector.fetch_overdue_invoices(None).await;
    connector.fetch_overdue_invoices(None).await;

    assert_eq!(fake.auth_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn progress_observer_sees_first_record() {
    let fake = Arc::new(FakeOdoo::standard());
    let seen = Mutex::new(Vec::new());
    let observer = |message: &str, percent: f64| {
        seen.lock().unwrap().push((message.to_string(), percent));
    };

    connector(&fake).fetch_overdue_invoices(Some(&observer)).await;

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "Processing invoice 1/3");
}

#[tokio::test]
async fn expired_session_logs_in_again_and_retries_once() {
    let fake = Arc::new(FakeOdoo::standard());
    let connector = connector(&fake);
    connector.connect().await.expect("login");

    fake.expire_session_once.store(true, Ordering::SeqCst);
    let records = connector
        .try_fetch_overdue_invoices_at(None, today())
        .await
        .expect("fetch after relogin");

    assert_eq!(records.len(), 3);
    assert_eq!(fake.auth_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invoice_pdf_is_printed_for_the_given_ids() {
    let fake = Arc::new(FakeOdoo::standard());
    let connector = connector(&fake);

    assert_eq!(connector.download_invoice_pdf(&[]).await.expect("empty"), None);
    assert!(fake.reports.lock().unwrap().is_empty());

    fake.expire_session_once.store(true, Ordering::SeqCst);
    let pdf = connector
        .download_invoice_pdf(&[3, 2])
        .await
        .expect("download")
        .expect("pdf");
    assert!(pdf.starts_with(b"%PDF"));
    assert_eq!(
        fake.reports.lock().unwrap().clone(),
        vec![("account.report_invoice".to_string(), vec![3, 2])]
    );
    assert_eq!(fake.auth_calls.load(Ordering::SeqCst), 2);
}
