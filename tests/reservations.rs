use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use innledger::engine::Engine;
use innledger::notify::NotifyHub;
use innledger::{reaper, wire};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(hold_ttl: Duration) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("innledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("innledger.wal"), Arc::new(NotifyHub::new()), hold_ttl).unwrap(),
    );

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "innledger".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("innledger")
        .user("innledger")
        .password("innledger");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Data rows of a simple query, each as owned column strings.
async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<Vec<Option<String>>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn error_code(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_room(client: &tokio_postgres::Client, units: u32) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, total_units, price_per_night, first_night, last_night) \
             VALUES ('{rid}', 'Suite', {units}, 20000, '2024-06-01', '2024-06-04')"
        ))
        .await
        .unwrap();
    rid
}

fn reserve_sql(id: Ulid, rid: Ulid, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO reservations (id, resource_id, requester_id, start_date, end_date) \
         VALUES ('{id}', '{rid}', '{}', '{start}', '{end}')",
        Ulid::new()
    )
}

async fn units_remaining(client: &tokio_postgres::Client, rid: Ulid) -> Vec<String> {
    rows(
        client,
        &format!(
            "SELECT * FROM ledger WHERE resource_id = '{rid}' AND date >= '2024-06-01' AND date < '2024-06-04'"
        ),
    )
    .await
    .into_iter()
    .map(|row| row[2].clone().unwrap())
    .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_resources() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let client = connect(addr).await;
    let rid = create_room(&client, 2).await;

    let listed = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0][0].as_deref(), Some(rid.to_string().as_str()));
    assert_eq!(listed[0][1].as_deref(), Some("Suite"));
    assert_eq!(listed[0][2].as_deref(), Some("2"));
    assert_eq!(listed[0][4].as_deref(), Some("2024-06-01"));
    assert_eq!(listed[0][5].as_deref(), Some("2024-06-03"));

    assert_eq!(units_remaining(&client, rid).await, vec!["2", "2", "2"]);
}

#[tokio::test]
async fn reserve_returns_hold_and_amount() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let client = connect(addr).await;
    let rid = create_room(&client, 1).await;

    let id = Ulid::new();
    let placed = rows(&client, &reserve_sql(id, rid, "2024-06-01", "2024-06-03")).await;
    assert_eq!(
        placed,
        vec![vec![
            Some(id.to_string()),
            Some("hold".to_string()),
            Some("40000".to_string())
        ]]
    );
    assert_eq!(units_remaining(&client, rid).await, vec!["0", "0", "1"]);

    let fetched = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0][5].as_deref(), Some("hold"));
}

#[tokio::test]
async fn sold_out_night_reports_insufficient_availability() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let client = connect(addr).await;
    let rid = create_room(&client, 1).await;

    rows(&client, &reserve_sql(Ulid::new(), rid, "2024-06-01", "2024-06-03")).await;
    let code = error_code(&client, &reserve_sql(Ulid::new(), rid, "2024-06-02", "2024-06-04")).await;
    assert_eq!(code, "53400");

    // The free night is still bookable.
    let ok = rows(&client, &reserve_sql(Ulid::new(), rid, "2024-06-03", "2024-06-04")).await;
    assert_eq!(ok.len(), 1);
}

#[tokio::test]
async fn confirm_then_cancel_is_invalid_state() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let client = connect(addr).await;
    let rid = create_room(&client, 1).await;
    let id = Ulid::new();
    rows(&client, &reserve_sql(id, rid, "2024-06-01", "2024-06-02")).await;

    let confirmed = rows(
        &client,
        &format!("INSERT INTO confirmations (reservation_id) VALUES ('{id}')"),
    )
    .await;
    assert_eq!(
        confirmed,
        vec![vec![Some(id.to_string()), Some("confirmed".to_string())]]
    );

    let code = error_code(&client, &format!("DELETE FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(code, "55000");
    assert_eq!(units_remaining(&client, rid).await, vec!["0", "1", "1"]);
}

#[tokio::test]
async fn cancel_returns_units() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let client = connect(addr).await;
    let rid = create_room(&client, 1).await;
    let id = Ulid::new();
    rows(&client, &reserve_sql(id, rid, "2024-06-01", "2024-06-04")).await;

    client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(units_remaining(&client, rid).await, vec!["1", "1", "1"]);

    let listed = rows(
        &client,
        &format!("SELECT * FROM reservations WHERE resource_id = '{rid}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0][5].as_deref(), Some("canceled"));
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let client = connect(addr).await;
    let rid = create_room(&client, 1).await;

    let unknown = Ulid::new();
    assert_eq!(
        error_code(&client, &format!("INSERT INTO confirmations (reservation_id) VALUES ('{unknown}')")).await,
        "P0002"
    );
    assert_eq!(
        error_code(&client, &reserve_sql(Ulid::new(), rid, "2024-06-03", "2024-06-01")).await,
        "22023"
    );
    assert_eq!(
        error_code(
            &client,
            "INSERT INTO resources (id, name, total_units, price_per_night, first_night, last_night) \
             VALUES ('not-a-ulid', NULL, 1, 0, '2024-06-01', '2024-06-02')"
        )
        .await,
        "42601"
    );
    assert_eq!(
        error_code(
            &client,
            &format!(
                "INSERT INTO resources (id, name, total_units, price_per_night, first_night, last_night) \
                 VALUES ('{rid}', NULL, 1, 0, '2024-06-01', '2024-06-02')"
            )
        )
        .await,
        "23505"
    );
}

#[tokio::test]
async fn concurrent_clients_cannot_oversell() {
    let (addr, _engine) = start_test_server(Duration::from_secs(900)).await;
    let setup = connect(addr).await;
    let rid = create_room(&setup, 2).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&reserve_sql(Ulid::new(), rid, "2024-06-01", "2024-06-04"))
                .await
                .is_ok()
        }));
    }
    let mut placed = 0;
    for h in handles {
        if h.await.unwrap() {
            placed += 1;
        }
    }
    assert_eq!(placed, 2);
    assert_eq!(units_remaining(&setup, rid).await, vec!["0", "0", "0"]);
}

#[tokio::test]
async fn abandoned_hold_released_by_sweep() {
    let (addr, engine) = start_test_server(Duration::from_millis(100)).await;
    let sweeper = tokio::spawn(reaper::run_reaper(engine.clone(), Duration::from_millis(25)));
    let client = connect(addr).await;
    let rid = create_room(&client, 1).await;
    let id = Ulid::new();
    rows(&client, &reserve_sql(id, rid, "2024-06-01", "2024-06-03")).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(units_remaining(&client, rid).await, vec!["1", "1", "1"]);
    let fetched = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(fetched[0][5].as_deref(), Some("released"));

    // Too late to confirm.
    assert_eq!(
        error_code(&client, &format!("INSERT INTO confirmations (reservation_id) VALUES ('{id}')")).await,
        "55000"
    );
    sweeper.abort();
}
