use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "coachcenter.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admins(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            verified INTEGER NOT NULL DEFAULT 0,
            role TEXT NOT NULL DEFAULT 'admin',
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS coaches(
            id TEXT PRIMARY KEY,
            admin_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT,
            UNIQUE(admin_id, email),
            FOREIGN KEY(admin_id) REFERENCES admins(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_coaches_admin ON coaches(admin_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            admin_id TEXT NOT NULL,
            name TEXT NOT NULL,
            timing TEXT NOT NULL DEFAULT 'Not Assigned',
            week_days TEXT NOT NULL DEFAULT '[]',
            fee REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            coach_id TEXT,
            coach_name TEXT,
            created_by TEXT,
            created_at TEXT,
            UNIQUE(admin_id, name),
            FOREIGN KEY(admin_id) REFERENCES admins(id),
            FOREIGN KEY(coach_id) REFERENCES coaches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_admin ON batches(admin_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_coach ON batches(coach_id)",
        [],
    )?;

    // Coach-side of the assignment relationship. UNIQUE(batch_id) is the
    // storage-level exclusivity guarantee: a batch can appear under at most
    // one coach no matter what the application layer does.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS coach_batches(
            coach_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(coach_id, batch_id),
            UNIQUE(batch_id),
            FOREIGN KEY(coach_id) REFERENCES coaches(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_coach_batches_coach ON coach_batches(coach_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            admin_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            batch_name TEXT NOT NULL,
            name TEXT NOT NULL,
            father_name TEXT NOT NULL,
            mother_name TEXT,
            phone TEXT NOT NULL,
            aadhar_number TEXT NOT NULL,
            school_name TEXT,
            address TEXT,
            created_by TEXT,
            created_at TEXT,
            FOREIGN KEY(admin_id) REFERENCES admins(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_admin ON students(admin_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
        [],
    )?;

    // Older workspaces predate the school/address columns. Add if needed.
    ensure_students_contact_columns(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            day TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'present',
            remark TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_attendance_remark(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student_day ON attendance_records(student_id, day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'paid',
            paid_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_student_month ON fee_records(student_id, month)",
        [],
    )?;

    Ok(())
}

fn ensure_students_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "school_name")? {
        conn.execute("ALTER TABLE students ADD COLUMN school_name TEXT", [])?;
    }
    if !table_has_column(conn, "students", "address")? {
        conn.execute("ALTER TABLE students ADD COLUMN address TEXT", [])?;
    }
    Ok(())
}

fn ensure_attendance_remark(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance_records", "remark")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance_records ADD COLUMN remark TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
