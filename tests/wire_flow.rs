use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use lessond::locks::ReservationLockManager;
use lessond::tenant::{Locale, TenantManager, Timezone};
use lessond::wire::{self, SessionDefaults};

const H: i64 = 3_600_000;
/// 2024-01-01 00:00 UTC, a Monday.
const MONDAY: i64 = 1_704_067_200_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("lessond_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        Arc::new(ReservationLockManager::in_memory()),
    ));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let defaults = SessionDefaults {
                    timezone: Timezone::utc(),
                    locale: Locale::En,
                };
                let _ = wire::process_connection(socket, tm, "lessond".to_string(), None, defaults).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("lessond")
        .password("lessond")
        .options("-c lc_messages=en");

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

struct School {
    instructor: Ulid,
    student: Ulid,
}

/// Mondays 09:00-12:00, one manual car, one student with `credits`.
async fn seed(client: &Client, credits: u32) -> School {
    let school = School {
        instructor: Ulid::new(),
        student: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO availability (id, instructor_id, day_of_week, start_time, end_time) \
             VALUES ('{}', '{}', 1, '09:00', '12:00')",
            Ulid::new(),
            school.instructor
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, type, status, plate) VALUES ('{}', 'manual', 'active', '1234-ABC')",
            Ulid::new()
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO students (id, credits) VALUES ('{}', {credits})",
            school.student
        ))
        .await
        .unwrap();
    school
}

async fn slots(client: &Client, instructor: Ulid) -> Vec<SimpleQueryRow> {
    rows(
        client
            .simple_query(&format!(
                "SELECT * FROM slots WHERE instructor_id = '{instructor}' AND date = '2024-01-01' AND vehicle_type = 'manual'"
            ))
            .await
            .unwrap(),
    )
}

async fn lock(client: &Client, instructor: Ulid, start: i64) -> Result<String, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            "INSERT INTO locks (instructor_id, start_at, end_at) VALUES ('{instructor}', {start}, {})",
            start + H
        ))
        .await?;
    Ok(rows(messages)[0].get("token").unwrap().to_string())
}

async fn book(
    client: &Client,
    school: &School,
    start: i64,
    token: &str,
) -> Result<Vec<SimpleQueryRow>, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            "INSERT INTO bookings (student_id, instructor_id, start_at, end_at, vehicle_type, token) \
             VALUES ('{}', '{}', {start}, {}, 'manual', '{token}')",
            school.student,
            school.instructor,
            start + H
        ))
        .await?;
    Ok(rows(messages))
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.as_db_error().map(|db| db.code().code()).unwrap_or("")
}

fn message(err: &tokio_postgres::Error) -> &str {
    err.as_db_error().map(|db| db.message()).unwrap_or("")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;

    let rows = slots(&client, school.instructor).await;
    let starts: Vec<&str> = rows.iter().map(|r| r.get("start_at").unwrap()).collect();
    assert_eq!(
        starts,
        vec![
            (MONDAY + 9 * H).to_string(),
            (MONDAY + 10 * H).to_string(),
            (MONDAY + 11 * H).to_string(),
        ]
    );
    assert_eq!(rows[0].get("local_start"), Some("2024-01-01T09:00+00:00"));
}

#[tokio::test]
async fn lock_then_book() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 3).await;
    let start = MONDAY + 10 * H;

    let token = lock(&client, school.instructor, start).await.unwrap();
    let booked = book(&client, &school, start, &token).await.unwrap();
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("CONFIRMED"));
    assert_eq!(booked[0].get("credits_cost"), Some("1"));
    assert!(booked[0].get("vehicle_id").is_some());

    assert_eq!(slots(&client, school.instructor).await.len(), 2);
    let student = rows(
        client
            .simple_query(&format!("SELECT * FROM students WHERE id = '{}'", school.student))
            .await
            .unwrap(),
    );
    assert_eq!(student[0].get("credits"), Some("2"));
}

#[tokio::test]
async fn second_lock_is_denied() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "school").await;
    let bob = connect(addr, "school").await;
    let school = seed(&alice, 1).await;
    let start = MONDAY + 9 * H;

    lock(&alice, school.instructor, start).await.unwrap();
    let err = lock(&bob, school.instructor, start).await.unwrap_err();
    assert_eq!(sqlstate(&err), "55P03");
    assert_eq!(message(&err), "This slot was just taken by another student.");
}

#[tokio::test]
async fn released_lock_can_be_retaken() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;
    let start = MONDAY + 9 * H;

    let token = lock(&client, school.instructor, start).await.unwrap();
    client
        .batch_execute(&format!(
            "DELETE FROM locks WHERE instructor_id = '{}' AND start_at = {start} AND end_at = {} AND token = '{token}'",
            school.instructor,
            start + H
        ))
        .await
        .unwrap();
    assert!(lock(&client, school.instructor, start).await.is_ok());
}

#[tokio::test]
async fn insufficient_credits_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 0).await;
    let start = MONDAY + 9 * H;

    let token = lock(&client, school.instructor, start).await.unwrap();
    let err = book(&client, &school, start, &token).await.unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");
    assert_eq!(message(&err), "Insufficient credits.");

    let bookings = rows(client.simple_query("SELECT * FROM bookings").await.unwrap());
    assert!(bookings.is_empty());
}

#[tokio::test]
async fn forged_token_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;
    let start = MONDAY + 9 * H;

    lock(&client, school.instructor, start).await.unwrap();
    let err = book(&client, &school, start, &Ulid::new().to_string()).await.unwrap_err();
    assert_eq!(sqlstate(&err), "55P03");
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;
    let start = MONDAY + 11 * H;

    let token = lock(&client, school.instructor, start).await.unwrap();
    let booked = book(&client, &school, start, &token).await.unwrap();
    let id = booked[0].get("id").unwrap().to_string();
    assert_eq!(slots(&client, school.instructor).await.len(), 2);

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(slots(&client, school.instructor).await.len(), 3);

    let mine = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE student_id = '{}'", school.student))
            .await
            .unwrap(),
    );
    assert_eq!(mine[0].get("status"), Some("CANCELLED"));
    assert!(mine[0].get("cancelled_at").is_some());
}

#[tokio::test]
async fn lifecycle_transitions() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;
    let start = MONDAY + 9 * H;

    let token = lock(&client, school.instructor, start).await.unwrap();
    let id = book(&client, &school, start, &token).await.unwrap()[0]
        .get("id")
        .unwrap()
        .to_string();

    client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status) VALUES ('{id}', 'CHECK_IN')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status, note) VALUES ('{id}', 'COMPLETED', 'parallel parking ok')"
        ))
        .await
        .unwrap();
    let err = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");

    let all = rows(client.simple_query("SELECT * FROM bookings").await.unwrap());
    assert_eq!(all[0].get("status"), Some("COMPLETED"));
    assert_eq!(all[0].get("instructor_notes"), Some("parallel parking ok"));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let a = connect(addr, "school_a").await;
    let b = connect(addr, "school_b").await;
    let school = seed(&a, 1).await;
    let start = MONDAY + 9 * H;

    let token = lock(&a, school.instructor, start).await.unwrap();
    book(&a, &school, start, &token).await.unwrap();

    assert!(rows(b.simple_query("SELECT * FROM bookings").await.unwrap()).is_empty());
    assert!(slots(&b, school.instructor).await.is_empty());
    // Same instructor and span, other tenant: a different lock key.
    assert!(lock(&b, school.instructor, start).await.is_ok());
    assert_eq!(tm.unscoped_bookings().len(), 1);
}

#[tokio::test]
async fn extended_protocol_queries() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;

    let instructor = school.instructor.to_string();
    let rows = client
        .query(
            "SELECT * FROM slots WHERE instructor_id = $1 AND date = $2 AND vehicle_type = $3",
            &[&instructor.as_str(), &"2024-01-01", &"manual"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    let first: &str = rows[0].get("instructor_id");
    assert_eq!(first, instructor);
    let vehicle_type: &str = rows[0].get("vehicle_type");
    assert_eq!(vehicle_type, "manual");
}

#[tokio::test]
async fn bad_sql_is_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let err = client.batch_execute("SELECT * FROM nowhere").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn only_rule_hours_can_be_booked() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 5).await;

    // Eight hours inside the rule window for one credit.
    let start = MONDAY + 9 * H;
    let messages = client
        .simple_query(&format!(
            "INSERT INTO locks (instructor_id, start_at, end_at) VALUES ('{}', {start}, {})",
            school.instructor,
            start + 8 * H
        ))
        .await
        .unwrap();
    let wide = rows(messages)[0].get("token").unwrap().to_string();
    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings (student_id, instructor_id, start_at, end_at, vehicle_type, token) \
             VALUES ('{}', '{}', {start}, {}, 'manual', '{wide}')",
            school.student,
            school.instructor,
            start + 8 * H
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55P03");

    // 03:00 has no rule behind it.
    let night = MONDAY + 3 * H;
    let token = lock(&client, school.instructor, night).await.unwrap();
    let err = book(&client, &school, night, &token).await.unwrap_err();
    assert_eq!(sqlstate(&err), "55P03");

    let mine = rows(
        client
            .simple_query(&format!("SELECT * FROM students WHERE id = '{}'", school.student))
            .await
            .unwrap(),
    );
    assert_eq!(mine[0].get("credits"), Some("5"));
    assert_eq!(slots(&client, school.instructor).await.len(), 3);
}

#[tokio::test]
async fn inverted_span_is_an_error_not_a_dropped_connection() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "school").await;
    let school = seed(&client, 1).await;

    let err = client
        .simple_query(&format!(
            "INSERT INTO locks (instructor_id, start_at, end_at) VALUES ('{}', 2000, 1000)",
            school.instructor
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    // Same connection keeps working.
    assert!(lock(&client, school.instructor, MONDAY + 9 * H).await.is_ok());
}
