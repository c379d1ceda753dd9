use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("registro.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates the register schema. Idempotent; also used by unit tests on an
/// in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT NOT NULL,
            dni TEXT,
            parent_phone TEXT,
            apoderado TEXT,
            phone2 TEXT,
            direccion TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_cohort ON students(grade, section)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_dni ON students(dni)",
        [],
    )?;

    // One status per (student, calendar day, curricular area).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            area TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, date, area),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_area_date ON attendance(area, date)",
        [],
    )?;

    // One level per (student, session token, curricular area).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS achievements(
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            area TEXT NOT NULL,
            level TEXT NOT NULL,
            competencia TEXT NOT NULL DEFAULT 'General',
            PRIMARY KEY(student_id, period, area),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_achievements_area ON achievements(area)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_digest TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
        [],
    )?;

    Ok(())
}
