use anyhow::Result;
use rusqlite::{Connection, params};

pub fn insert_gallery_image(conn: &Connection, url: &str, title: Option<&str>) -> Result<i64> {
    let created_at = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO gallery_images (url, title, created_at) VALUES (?1, ?2, ?3)",
        params![url, title, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_event(conn: &Connection, slug: Option<&str>, title: &str) -> Result<i64> {
    let created_at = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO events (slug, title, created_at) VALUES (?1, ?2, ?3)",
        params![slug, title, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_event_image(conn: &Connection, event_id: i64, url: &str) -> Result<i64> {
    let created_at = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO event_images (event_id, url, created_at) VALUES (?1, ?2, ?3)",
        params![event_id, url, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}
