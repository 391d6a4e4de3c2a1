use anyhow::Result;
use rusqlite::Connection;
use crate::pipeline::corpus::SourceHit;

/// Gallery listing, newest first. Each image links to its own gallery page.
pub fn list_gallery_images(conn: &Connection) -> Result<Vec<SourceHit>> {
    let mut stmt = conn.prepare(
        "SELECT id, url FROM gallery_images ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        let id: i64 = row.get(0)?;
        let url: String = row.get(1)?;
        Ok(SourceHit::new(url, Some(format!("/gallery/{}", id))))
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Event photo listing, newest event first. Images link to their event page;
/// events without a slug fall back to the collection default.
pub fn list_event_images(conn: &Connection) -> Result<Vec<SourceHit>> {
    let mut stmt = conn.prepare(
        "SELECT ei.url, e.slug
         FROM event_images ei
         JOIN events e ON e.id = ei.event_id
         ORDER BY e.created_at DESC, e.id DESC, ei.id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let url: String = row.get(0)?;
        let slug: Option<String> = row.get(1)?;
        Ok(SourceHit::new(url, slug.map(|s| format!("/events/{}", s))))
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn count_images(conn: &Connection) -> Result<(i64, i64)> {
    let gallery: i64 = conn.query_row("SELECT COUNT(*) FROM gallery_images", [], |r| r.get(0))?;
    let events: i64 = conn.query_row("SELECT COUNT(*) FROM event_images", [], |r| r.get(0))?;
    Ok((gallery, events))
}
