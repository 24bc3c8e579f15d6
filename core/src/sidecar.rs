//! SidecarCodec: read/write one [`Record`]'s metadata as a per-image XML
//! sidecar file (spec §4.2, §6.1).
//!
//! The element schema is the fixed shape shown by
//! `sidecar_assets/template.xmp`. Rather than re-parsing `{field}` markers
//! out of that template at runtime (the source's dynamically-typed
//! descriptor-per-field pattern, flagged in spec §9 for replacement), the
//! field→location mapping is a compile-time table: `uid`/`hash`/`source`/
//! `group_id`/`rating`/`date`/`last_updated` are `rdf:Description`
//! attributes; `authors`/`keywords`/`collections`/`source_other`/
//! `source_via` are RDF-Bag-or-Seq list containers; `caption` is a single
//! default entry in an `rdf:Alt`. The template file is shipped as the
//! canonical reference for that shape and is not executed.

use crate::record::{Rating, Record};
use crate::timefmt;
use crate::{ImgcatError, Result};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

const DESCRIPTION: &[u8] = b"rdf:Description";
const LI: &[u8] = b"rdf:li";
const CREATOR: &[u8] = b"dc:creator";
const SUBJECT: &[u8] = b"dc:subject";
const COLLECTIONS: &[u8] = b"ic:collections";
const SOURCE_OTHER: &[u8] = b"ic:source_other";
const SOURCE_VIA: &[u8] = b"ic:source_via";
const DESCRIPTION_TEXT: &[u8] = b"dc:description";

/// Reads a sidecar file into a [`Record`]. `hash_bits` is the configured
/// hash width (supplied out-of-band, matching the trie's on-disk format).
pub fn read_sidecar(path: &Path, hash_bits: usize) -> Result<Record> {
    let xml = std::fs::read_to_string(path).map_err(|e| ImgcatError::IoError {
        message: format!("reading sidecar {}: {e}", path.display()),
    })?;
    parse_sidecar(&xml, hash_bits)
}

fn parse_sidecar(xml: &str, hash_bits: usize) -> Result<Record> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current_text = String::new();

    let mut uid: Option<Uuid> = None;
    let mut hash: Option<String> = None;
    let mut source: Option<String> = None;
    let mut group_id: Option<Uuid> = None;
    let mut rating: Option<Rating> = None;
    let mut date: Option<String> = None;
    let mut last_updated: Option<String> = None;

    let mut authors: Vec<String> = Vec::new();
    let mut keywords: BTreeSet<String> = BTreeSet::new();
    let mut collections: BTreeSet<String> = BTreeSet::new();
    let mut source_other: BTreeSet<String> = BTreeSet::new();
    let mut source_via: BTreeSet<String> = BTreeSet::new();
    let mut caption: Option<String> = None;
    let mut saw_description = false;

    loop {
        match reader.read_event().map_err(|e| ImgcatError::ValidationError {
            message: format!("malformed sidecar XML: {e}"),
        })? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == DESCRIPTION {
                    saw_description = true;
                    for attr in e.attributes().flatten() {
                        let key = attr.key.as_ref();
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .unwrap_or_default()
                            .to_string();
                        match key {
                            b"ic:uid" => uid = Some(parse_uuid(&value)?),
                            b"ic:hash" => hash = Some(value),
                            b"ic:source" => source = Some(value),
                            b"ic:group_id" => group_id = Some(parse_uuid(&value)?),
                            b"ic:rating" => {
                                rating = value.chars().next().and_then(Rating::from_code)
                            }
                            b"ic:date" => date = Some(value),
                            b"ic:last_updated" => last_updated = Some(value),
                            _ => {}
                        }
                    }
                }
                current_text.clear();
                stack.push(name);
            }
            Event::Empty(e) => {
                // Only relevant for attribute-bearing self-closed Description.
                let name = e.name().as_ref().to_vec();
                if name == DESCRIPTION {
                    saw_description = true;
                    for attr in e.attributes().flatten() {
                        let key = attr.key.as_ref();
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .unwrap_or_default()
                            .to_string();
                        match key {
                            b"ic:uid" => uid = Some(parse_uuid(&value)?),
                            b"ic:hash" => hash = Some(value),
                            b"ic:source" => source = Some(value),
                            b"ic:group_id" => group_id = Some(parse_uuid(&value)?),
                            b"ic:rating" => {
                                rating = value.chars().next().and_then(Rating::from_code)
                            }
                            b"ic:date" => date = Some(value),
                            b"ic:last_updated" => last_updated = Some(value),
                            _ => {}
                        }
                    }
                }
            }
            Event::Text(t) => {
                current_text.push_str(&t.unescape().unwrap_or_default());
            }
            Event::End(e) => {
                let name = e.name().as_ref().to_vec();
                stack.pop();
                if name == LI {
                    let text = std::mem::take(&mut current_text);
                    match container_of(&stack) {
                        Some(c) if c == CREATOR => authors.push(text),
                        Some(c) if c == SUBJECT => {
                            keywords.insert(text);
                        }
                        Some(c) if c == COLLECTIONS => {
                            collections.insert(text);
                        }
                        Some(c) if c == SOURCE_OTHER => {
                            source_other.insert(text);
                        }
                        Some(c) if c == SOURCE_VIA => {
                            source_via.insert(text);
                        }
                        Some(c) if c == DESCRIPTION_TEXT => caption = Some(text),
                        _ => {}
                    }
                }
                current_text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_description {
        return Err(ImgcatError::ValidationError {
            message: "sidecar missing rdf:Description".to_string(),
        });
    }

    let uid = uid.ok_or_else(|| ImgcatError::ValidationError {
        message: "sidecar missing uid".to_string(),
    })?;
    let hash = hash.ok_or_else(|| ImgcatError::ValidationError {
        message: "sidecar missing hash".to_string(),
    })?;
    let hash = crate::hash::Hash::from_hex(&hash, hash_bits)?;
    let date = date.ok_or_else(|| ImgcatError::ValidationError {
        message: "sidecar missing date".to_string(),
    })?;
    let date = timefmt::from_sidecar_string(&date)?;
    let last_updated = last_updated.ok_or_else(|| ImgcatError::ValidationError {
        message: "sidecar missing last_updated".to_string(),
    })?;
    let last_updated = timefmt::from_sidecar_string(&last_updated)?;

    Ok(Record {
        uid,
        hash,
        caption,
        authors: if authors.is_empty() { None } else { Some(authors) },
        keywords,
        source,
        group_id,
        collections,
        rating,
        date,
        last_updated,
        source_other,
        source_via,
    })
}

/// Finds the nearest ancestor in `stack` (excluding the just-popped `rdf:li`)
/// that is one of our known list-container wrapper elements.
fn container_of(stack: &[Vec<u8>]) -> Option<&'static [u8]> {
    for name in stack.iter().rev() {
        let n = name.as_slice();
        if n == CREATOR {
            return Some(CREATOR);
        }
        if n == SUBJECT {
            return Some(SUBJECT);
        }
        if n == COLLECTIONS {
            return Some(COLLECTIONS);
        }
        if n == SOURCE_OTHER {
            return Some(SOURCE_OTHER);
        }
        if n == SOURCE_VIA {
            return Some(SOURCE_VIA);
        }
        if n == DESCRIPTION_TEXT {
            return Some(DESCRIPTION_TEXT);
        }
        if n == DESCRIPTION {
            return None;
        }
    }
    None
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    let normalized = s.replace('-', "");
    Uuid::parse_str(&normalized)
        .or_else(|_| Uuid::parse_str(s))
        .map_err(|e| ImgcatError::ValidationError {
            message: format!("invalid uid '{s}': {e}"),
        })
}

/// Writes `record` as a new sidecar document following the template's
/// schema. Null fields leave neither attribute nor list element (spec
/// §4.2 write contract). The write itself is a plain full-file write; the
/// synchronizer (§4.4) supplies crash-tolerance via write-then-rename.
pub fn write_sidecar(path: &Path, record: &Record) -> Result<()> {
    let xml = render_sidecar(record)?;
    std::fs::write(path, xml).map_err(|e| ImgcatError::IoError {
        message: format!("writing sidecar {}: {e}", path.display()),
    })
}

fn render_sidecar(record: &Record) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 1);

    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut meta = BytesStart::new("x:xmpmeta");
    meta.push_attribute(("xmlns:x", "adobe:ns:meta/"));
    writer.write_event(Event::Start(meta.clone())).map_err(xml_err)?;

    let mut rdf = BytesStart::new("rdf:RDF");
    rdf.push_attribute(("xmlns:rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#"));
    rdf.push_attribute(("xmlns:dc", "http://purl.org/dc/elements/1.1/"));
    rdf.push_attribute(("xmlns:ic", "urn:imgcat:"));
    writer.write_event(Event::Start(rdf.clone())).map_err(xml_err)?;

    let mut desc = BytesStart::new("rdf:Description");
    desc.push_attribute(("rdf:about", ""));
    desc.push_attribute(("ic:uid", record.uid.simple().to_string().as_str()));
    desc.push_attribute(("ic:hash", record.hash.to_hex().as_str()));
    if let Some(source) = &record.source {
        desc.push_attribute(("ic:source", source.as_str()));
    }
    if let Some(group_id) = &record.group_id {
        desc.push_attribute(("ic:group_id", group_id.simple().to_string().as_str()));
    }
    if let Some(rating) = record.rating {
        desc.push_attribute(("ic:rating", rating.code().to_string().as_str()));
    }
    desc.push_attribute(("ic:date", timefmt::to_sidecar_string(record.date).as_str()));
    desc.push_attribute((
        "ic:last_updated",
        timefmt::to_sidecar_string(record.last_updated).as_str(),
    ));
    writer.write_event(Event::Start(desc.clone())).map_err(xml_err)?;

    if let Some(authors) = &record.authors {
        if !authors.is_empty() {
            write_list(&mut writer, "dc:creator", "rdf:Seq", authors.iter())?;
        }
    }
    if !record.keywords.is_empty() {
        write_list(&mut writer, "dc:subject", "rdf:Bag", record.keywords.iter())?;
    }
    if !record.collections.is_empty() {
        write_list(&mut writer, "ic:collections", "rdf:Bag", record.collections.iter())?;
    }
    if !record.source_other.is_empty() {
        write_list(&mut writer, "ic:source_other", "rdf:Bag", record.source_other.iter())?;
    }
    if !record.source_via.is_empty() {
        write_list(&mut writer, "ic:source_via", "rdf:Bag", record.source_via.iter())?;
    }
    if let Some(caption) = &record.caption {
        let wrapper = BytesStart::new("dc:description");
        writer.write_event(Event::Start(wrapper.clone())).map_err(xml_err)?;
        let alt = BytesStart::new("rdf:Alt");
        writer.write_event(Event::Start(alt.clone())).map_err(xml_err)?;
        let mut li = BytesStart::new("rdf:li");
        li.push_attribute(("xml:lang", "x-default"));
        writer.write_event(Event::Start(li.clone())).map_err(xml_err)?;
        writer
            .write_event(Event::Text(BytesText::new(caption)))
            .map_err(xml_err)?;
        writer.write_event(Event::End(li.to_end())).map_err(xml_err)?;
        writer.write_event(Event::End(alt.to_end())).map_err(xml_err)?;
        writer.write_event(Event::End(wrapper.to_end())).map_err(xml_err)?;
    }

    writer.write_event(Event::End(desc.to_end())).map_err(xml_err)?;
    writer.write_event(Event::End(rdf.to_end())).map_err(xml_err)?;
    writer.write_event(Event::End(meta.to_end())).map_err(xml_err)?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| ImgcatError::InternalError {
        message: format!("sidecar writer produced non-UTF8 output: {e}"),
    })
}

fn write_list<'a>(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    wrapper: &str,
    container: &str,
    items: impl Iterator<Item = &'a String>,
) -> Result<()> {
    let w = BytesStart::new(wrapper);
    writer.write_event(Event::Start(w.clone())).map_err(xml_err)?;
    let c = BytesStart::new(container);
    writer.write_event(Event::Start(c.clone())).map_err(xml_err)?;
    for item in items {
        let li = BytesStart::new("rdf:li");
        writer.write_event(Event::Start(li.clone())).map_err(xml_err)?;
        writer.write_event(Event::Text(BytesText::new(item))).map_err(xml_err)?;
        writer.write_event(Event::End(li.to_end())).map_err(xml_err)?;
    }
    writer.write_event(Event::End(c.to_end())).map_err(xml_err)?;
    writer.write_event(Event::End(w.to_end())).map_err(xml_err)?;
    Ok(())
}

fn xml_err(e: std::io::Error) -> ImgcatError {
    ImgcatError::InternalError {
        message: format!("xml writer error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Rating;
    use std::collections::BTreeSet;
    use time::OffsetDateTime;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn s3_sidecar_round_trip() {
        let uid = Uuid::parse_str("04a10461-a60b-4dc3-8d91-4a91b311f004").unwrap();
        let hash = crate::hash::Hash::from_hex(&"b5".repeat(16), 128).unwrap();
        let record = Record {
            uid,
            hash,
            caption: Some("Test Caption".to_string()),
            authors: Some(vec!["test_author".to_string()]),
            keywords: set(&["test_keyword", "test_keyword_2"]),
            source: Some("http://example.com/example_image.jpg".to_string()),
            group_id: Some(uid),
            collections: set(&["test_collection", "test_collection2", "test_collection3"]),
            rating: Some(Rating::Questionable),
            date: timefmt::from_sidecar_string("2017-05-29T00:00:59.412Z").unwrap(),
            last_updated: timefmt::from_sidecar_string("2017-05-29T00:00:59.412Z").unwrap(),
            source_other: set(&["http://example.com", "http://example.de"]),
            source_via: set(&["http://example.com", "http://example.de"]),
        };

        let tmp = tempfile::NamedTempFile::new().unwrap();
        write_sidecar(tmp.path(), &record).unwrap();
        let read_back = read_sidecar(tmp.path(), 128).unwrap();

        assert_eq!(read_back.uid, record.uid);
        assert_eq!(read_back.hash, record.hash);
        assert_eq!(read_back.caption, record.caption);
        assert_eq!(read_back.authors, record.authors);
        assert_eq!(read_back.keywords, record.keywords);
        assert_eq!(read_back.source, record.source);
        assert_eq!(read_back.group_id, record.group_id);
        assert_eq!(read_back.collections, record.collections);
        assert_eq!(read_back.rating, record.rating);
        assert_eq!(read_back.date, record.date);
        assert_eq!(read_back.last_updated, record.last_updated);
        assert_eq!(read_back.source_other, record.source_other);
        assert_eq!(read_back.source_via, record.source_via);
    }

    #[test]
    fn null_fields_write_no_attribute_or_element() {
        let record = Record {
            uid: Uuid::nil(),
            hash: crate::hash::Hash::from_hex("00", 8).unwrap(),
            caption: None,
            authors: None,
            keywords: BTreeSet::new(),
            source: None,
            group_id: None,
            collections: BTreeSet::new(),
            rating: None,
            date: OffsetDateTime::UNIX_EPOCH,
            last_updated: OffsetDateTime::UNIX_EPOCH,
            source_other: BTreeSet::new(),
            source_via: BTreeSet::new(),
        };
        let xml = render_sidecar(&record).unwrap();
        assert!(!xml.contains("ic:source="));
        assert!(!xml.contains("ic:rating="));
        assert!(!xml.contains("dc:creator"));
        assert!(!xml.contains("dc:description"));

        let read_back = parse_sidecar(&xml, 8).unwrap();
        assert!(read_back.source.is_none());
        assert!(read_back.rating.is_none());
        assert!(read_back.authors.is_none());
        assert!(read_back.caption.is_none());
    }

    #[test]
    fn missing_sidecar_file_is_io_error() {
        let err = read_sidecar(Path::new("/nonexistent/path.xmp"), 256).unwrap_err();
        assert!(matches!(err, ImgcatError::IoError { .. }));
    }
}
