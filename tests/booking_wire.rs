use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use medsched::tenant::TenantManager;
use medsched::wire;

const PASSWORD: &str = "medsched";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("medsched_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn try_connect(addr: SocketAddr, db: &str, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, db: &str, user: &str) -> Client {
    try_connect(addr, db, user).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.code().map(|c| c.code()).unwrap_or("")
}

/// Register one practitioner and one patient as admin.
async fn seed(admin: &Client) -> (Ulid, Ulid) {
    let p = Ulid::new();
    let s = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO practitioners (id, name) VALUES ('{p}', 'Dr. Lima'); \
             INSERT INTO subjects (id, name) VALUES ('{s}', 'Ana')"
        ))
        .await
        .unwrap();
    (p, s)
}

fn book_sql(id: Ulid, p: Ulid, s: Ulid, start: &str, minutes: i64) -> String {
    format!(
        "INSERT INTO bookings (id, practitioner_id, subject_id, start, duration_minutes) \
         VALUES ('{id}', '{p}', '{s}', '{start}', {minutes})"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn clinic_day_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;

    let first = Ulid::new();
    admin
        .batch_execute(&book_sql(first, p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap();

    let err = admin
        .batch_execute(&book_sql(Ulid::new(), p, s, "2025-01-01 10:15", 30))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    admin
        .batch_execute(&book_sql(Ulid::new(), p, s, "2025-01-01 10:30", 30))
        .await
        .unwrap();

    admin
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{first}'"))
        .await
        .unwrap();
    admin
        .batch_execute(&book_sql(Ulid::new(), p, s, "2025-01-01 10:15", 15))
        .await
        .unwrap();

    let listed = rows(&admin, &format!("SELECT * FROM bookings WHERE practitioner_id = '{p}'")).await;
    let statuses: Vec<&str> = listed.iter().map(|r| r.get("status").unwrap()).collect();
    assert_eq!(statuses, vec!["cancelled", "scheduled", "scheduled"]);
    assert_eq!(listed[1].get("duration_minutes"), Some("15"));
}

#[tokio::test]
async fn conflicts_and_free_slots() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;
    let existing = Ulid::new();
    admin
        .batch_execute(&book_sql(existing, p, s, "2025-01-01 10:00", 60))
        .await
        .unwrap();

    let hit = rows(
        &admin,
        &format!("SELECT * FROM conflicts WHERE practitioner_id = '{p}' AND start = '2025-01-01 10:30'"),
    )
    .await;
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].get("booking_id"), Some(existing.to_string().as_str()));

    let clear = rows(
        &admin,
        &format!("SELECT * FROM conflicts WHERE practitioner_id = '{p}' AND start = '2025-01-01 11:00'"),
    )
    .await;
    assert!(clear.is_empty());

    let free = rows(
        &admin,
        &format!(
            "SELECT * FROM availability WHERE practitioner_id = '{p}' \
             AND start >= '2025-01-01 09:00' AND \"end\" <= '2025-01-01 12:00'"
        ),
    )
    .await;
    let spans: Vec<(&str, &str)> = free
        .iter()
        .map(|r| (r.get("start").unwrap(), r.get("end").unwrap()))
        .collect();
    assert_eq!(
        spans,
        vec![
            ("1735722000000", "1735725600000"),
            ("1735729200000", "1735732800000"),
        ]
    );
}

#[tokio::test]
async fn status_and_reschedule_tables() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;
    let b = Ulid::new();
    admin
        .batch_execute(&book_sql(b, p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap();

    admin
        .batch_execute(&format!(
            "INSERT INTO reschedules (booking_id, start) VALUES ('{b}', '2025-01-01 14:00')"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO booking_status (booking_id, status) VALUES ('{b}', 'confirmed')"
        ))
        .await
        .unwrap();

    let row = &rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{b}'")).await[0];
    assert_eq!(row.get("status"), Some("confirmed"));
    assert_eq!(row.get("start"), Some("1735740000000"));

    let err = admin
        .batch_execute(&format!(
            "INSERT INTO booking_status (booking_id, status) VALUES ('{b}', 'scheduled')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    let audit = rows(&admin, "SELECT * FROM audit_log").await;
    assert!(audit.iter().all(|r| r.get("actor") == Some("admin")));
    assert!(audit.iter().any(|r| r.get("action") == Some("UPDATE")));
}

#[tokio::test]
async fn clinics_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let north = connect(addr, "north", "admin").await;
    let south = connect(addr, "south", "admin").await;

    let (p, s) = seed(&north).await;
    north
        .batch_execute(&book_sql(Ulid::new(), p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap();

    assert!(rows(&south, "SELECT * FROM practitioners").await.is_empty());
    let err = south
        .batch_execute(&book_sql(Ulid::new(), p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

#[tokio::test]
async fn practitioners_only_touch_their_own_agenda() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;
    let (other, _) = seed(&admin).await;

    let doctor = connect(addr, "clinic", &format!("practitioner_{p}")).await;
    doctor
        .batch_execute(&book_sql(Ulid::new(), p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap();

    let err = doctor
        .batch_execute(&book_sql(Ulid::new(), other, s, "2025-01-01 10:00", 30))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let err = doctor
        .simple_query("SELECT * FROM audit_log")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    assert_eq!(
        rows(&doctor, &format!("SELECT * FROM bookings WHERE practitioner_id = '{p}'"))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn patients_cancel_only_their_own_bookings() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;
    let (_, stranger) = seed(&admin).await;

    let mine = Ulid::new();
    let theirs = Ulid::new();
    admin
        .batch_execute(&book_sql(mine, p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap();
    admin
        .batch_execute(&book_sql(theirs, p, stranger, "2025-01-01 11:00", 30))
        .await
        .unwrap();

    let patient = connect(addr, "clinic", &format!("subject_{s}")).await;
    let err = patient
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{theirs}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    patient
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{mine}'"))
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_role_is_refused() {
    let (addr, _tm) = start_test_server().await;
    assert!(try_connect(addr, "clinic", "postgres").await.is_err());
}

#[tokio::test]
async fn syntax_errors_report_42601() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let err = admin.simple_query("DROP TABLE bookings").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;

    let id = Ulid::new().to_string();
    let (p_str, s_str) = (p.to_string(), s.to_string());
    let inserted = admin
        .execute(
            "INSERT INTO bookings (id, practitioner_id, subject_id, start, notes) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&id, &p_str, &s_str, &"2025-01-01T10:00:00Z", &"patient's first visit"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let row = &rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await[0];
    assert_eq!(row.get("notes"), Some("patient's first visit"));
    assert_eq!(row.get("duration_minutes"), Some("30"));

    // A bound value that looks like a placeholder stays literal text.
    admin
        .execute(
            "INSERT INTO booking_notes (booking_id, notes) VALUES ($1, $2)",
            &[&id, &"price $1 paid"],
        )
        .await
        .unwrap();
    let row = &rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await[0];
    assert_eq!(row.get("notes"), Some("price $1 paid"));
}

#[tokio::test]
async fn notes_are_edited_by_the_agenda_owner() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr, "clinic", "admin").await;
    let (p, s) = seed(&admin).await;
    let b = Ulid::new();
    admin
        .batch_execute(&book_sql(b, p, s, "2025-01-01 10:00", 30))
        .await
        .unwrap();

    let doctor = connect(addr, "clinic", &format!("practitioner_{p}")).await;
    doctor
        .batch_execute(&format!(
            "INSERT INTO booking_notes (booking_id, notes) VALUES ('{b}', 'fasting required')"
        ))
        .await
        .unwrap();

    let patient = connect(addr, "clinic", &format!("subject_{s}")).await;
    let err = patient
        .batch_execute(&format!(
            "INSERT INTO booking_notes (booking_id, notes) VALUES ('{b}', 'never mind')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let row = &rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{b}'")).await[0];
    assert_eq!(row.get("notes"), Some("fasting required"));
    assert_eq!(row.get("status"), Some("scheduled"));

    let audit = rows(&admin, "SELECT * FROM audit_log LIMIT 1").await;
    assert_eq!(audit[0].get("actor"), Some(format!("practitioner_{p}").as_str()));
    assert_eq!(audit[0].get("action"), Some("UPDATE"));
}
