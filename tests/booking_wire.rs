use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use drivealive::auth::Credentials;
use drivealive::config::SlotPolicy;
use drivealive::engine::Engine;
use drivealive::notify::NotifyHub;
use drivealive::wire;

const USER: &str = "frontend";
const PASSWORD: &str = "drivealive";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("drivealive_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("drivealive.wal"), Arc::new(NotifyHub::new()), SlotPolicy::default())
            .unwrap(),
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
                let credentials = Credentials::new(Some(USER.into()), PASSWORD.into());
                let _ = wire::process_connection(socket, engine, credentials, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("drivealive")
        .user(USER)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Instructor working Mondays 08:00–12:00.
async fn setup_instructor(client: &Client) -> Ulid {
    let iid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO instructors (id, name) VALUES ('{iid}', 'Thandi')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO schedule (id, instructor_id, day_of_week, start_time, end_time) \
             VALUES ('{}', '{iid}', 'monday', '08:00', '12:00')",
            Ulid::new()
        ))
        .await
        .unwrap();
    iid
}

async fn monday_slots(client: &Client, iid: Ulid) -> Vec<(String, String)> {
    let result = client
        .simple_query(&format!(
            "SELECT * FROM available_slots WHERE instructor_id = '{iid}' \
             AND \"date\" >= '2025-03-03' AND \"date\" <= '2025-03-03'"
        ))
        .await
        .unwrap();
    rows(result)
        .iter()
        .filter_map(|r| Some((r.get("start")?.to_string(), r.get("end")?.to_string())))
        .collect()
}

fn insert_booking_sql(iid: Ulid, start: &str) -> String {
    format!(
        "INSERT INTO bookings (id, instructor_id, student_id, start) VALUES ('{}', '{iid}', '{}', '{start}')",
        Ulid::new(),
        Ulid::new()
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let iid = setup_instructor(&client).await;

    let slots = monday_slots(&client, iid).await;
    assert_eq!(
        slots,
        vec![
            ("2025-03-03 08:00:00".to_string(), "2025-03-03 09:00:00".to_string()),
            ("2025-03-03 09:15:00".to_string(), "2025-03-03 10:15:00".to_string()),
            ("2025-03-03 10:30:00".to_string(), "2025-03-03 11:30:00".to_string()),
        ]
    );
}

#[tokio::test]
async fn dates_without_slots_are_still_listed() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let iid = setup_instructor(&client).await;

    let listed = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM available_slots WHERE instructor_id = '{iid}' \
                 AND \"date\" >= '2025-03-03' AND \"date\" <= '2025-03-05'"
            ))
            .await
            .unwrap(),
    );
    let dates: Vec<&str> = listed.iter().filter_map(|r| r.get("date")).collect();
    assert_eq!(
        dates,
        vec!["2025-03-03", "2025-03-03", "2025-03-03", "2025-03-04", "2025-03-05"]
    );
    // Tuesday and Wednesday have no working hours
    for row in &listed[3..] {
        assert_eq!(row.get("start"), None);
        assert_eq!(row.get("end"), None);
    }
}

#[tokio::test]
async fn booking_then_conflict_is_exclusion_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let iid = setup_instructor(&client).await;

    client
        .batch_execute(&insert_booking_sql(iid, "2025-03-03 09:15"))
        .await
        .unwrap();
    assert_eq!(monday_slots(&client, iid).await.len(), 2);

    let err = client
        .batch_execute(&insert_booking_sql(iid, "2025-03-03 09:30"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let bookings = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE instructor_id = '{iid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("status"), Some("pending"));
}

#[tokio::test]
async fn cancel_via_delete_frees_slot() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let iid = setup_instructor(&client).await;

    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, instructor_id, student_id, start, duration_minutes) \
             VALUES ('{bid}', '{iid}', '{}', '2025-03-03 08:00', 60)",
            Ulid::new()
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();

    assert_eq!(monday_slots(&client, iid).await.len(), 3);
    let bookings = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE instructor_id = '{iid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(bookings[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn racing_clients_one_winner() {
    let (addr, engine) = start_test_server().await;
    let setup = connect(addr).await;
    let iid = setup_instructor(&setup).await;

    let a = connect(addr).await;
    let b = connect(addr).await;
    let sql_a = insert_booking_sql(iid, "2025-03-03 10:30");
    let sql_b = insert_booking_sql(iid, "2025-03-03 10:30");
    let (ra, rb) = tokio::join!(a.batch_execute(&sql_a), b.batch_execute(&sql_b));

    assert_eq!([ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let loser = ra.err().or(rb.err()).unwrap();
    assert_eq!(loser.code(), Some(&SqlState::EXCLUSION_VIOLATION));
    assert_eq!(engine.get_bookings(iid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn time_off_and_custom_availability_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let iid = setup_instructor(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO time_off (id, instructor_id, start_date, end_date, start_time, end_time, reason) \
             VALUES ('{}', '{iid}', '2025-03-03', '2025-03-03', '08:00', '09:00', 'dentist')",
            Ulid::new()
        ))
        .await
        .unwrap();
    assert_eq!(monday_slots(&client, iid).await.len(), 2);

    client
        .batch_execute(&format!(
            "INSERT INTO custom_availability (id, instructor_id, date, start_time, end_time) \
             VALUES ('{}', '{iid}', '2025-03-08', '09:00', '11:00')",
            Ulid::new()
        ))
        .await
        .unwrap();
    let saturday = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM available_slots WHERE instructor_id = '{iid}' AND \"date\" = '2025-03-08'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(saturday.len(), 1);

    let time_off = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM time_off WHERE instructor_id = '{iid}' \
                 AND \"date\" >= '2025-03-01' AND \"date\" <= '2025-03-31'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(time_off.len(), 1);
    assert_eq!(time_off[0].get("reason"), Some("dentist"));
}

#[tokio::test]
async fn errors_map_to_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.batch_execute("SELECT * FROM nowhere").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = client
        .batch_execute(&format!("SELECT * FROM schedule WHERE instructor_id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));
}

#[tokio::test]
async fn list_schedule_and_instructors() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let iid = setup_instructor(&client).await;

    let schedule = rows(
        client
            .simple_query(&format!("SELECT * FROM schedule WHERE instructor_id = '{iid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(schedule.len(), 1);
    assert_eq!(schedule[0].get("day_of_week"), Some("Mon"));
    assert_eq!(schedule[0].get("start_time"), Some("08:00:00"));

    let instructors = rows(client.simple_query("SELECT * FROM instructors").await.unwrap());
    assert_eq!(instructors.len(), 1);
    assert_eq!(instructors[0].get("name"), Some("Thandi"));
}

#[tokio::test]
async fn unknown_role_is_refused() {
    let (addr, _engine) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("drivealive")
        .user("postgres")
        .password(PASSWORD);

    assert!(config.connect(NoTls).await.is_err());

    // the configured role still gets in
    let client = connect(addr).await;
    assert!(client.simple_query("SELECT * FROM instructors").await.is_ok());
}
