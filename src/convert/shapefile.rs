//! ESRI shapefile reader (`.shp` geometry + `.dbf` attributes)
//!
//! Supports null, point, polyline, polygon and multipoint shapes including
//! their Z and M variants; only X and Y are kept.

use super::vector::{Feature, FeatureCollection, Geometry, Position};
use crate::error::{Error, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde_json::{Map, Number, Value};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_CODE: i32 = 9994;
const HEADER_LEN: usize = 100;

fn malformed(message: impl Into<String>) -> Error {
    Error::Other(format!("malformed shapefile: {}", message.into()))
}

/// Read a `.shp` file and its `.dbf` sibling (if any) into features
pub fn read_shapefile(shp_path: &Path) -> Result<FeatureCollection> {
    let shapes = read_shapes(&std::fs::read(shp_path)?)?;
    let records = match sibling(shp_path, "dbf") {
        Some(dbf) => read_dbf(&std::fs::read(dbf)?)?,
        None => Vec::new(),
    };
    debug!(
        path = %shp_path.display(),
        shapes = shapes.len(),
        records = records.len(),
        "Read shapefile"
    );

    let mut records = records.into_iter();
    let features = shapes
        .into_iter()
        .map(|geometry| Feature::new(geometry, records.next().unwrap_or_default()))
        .collect();
    Ok(FeatureCollection::new(features))
}

/// Same stem with another extension, matched case-insensitively
pub(crate) fn sibling(path: &Path, extension: &str) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy().to_string();
    let parent = path.parent()?;
    std::fs::read_dir(parent)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|candidate| {
            candidate.file_stem().map(|s| s.to_string_lossy() == stem.as_str()) == Some(true)
                && candidate
                    .extension()
                    .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
                    == Some(true)
        })
}

/// Parse the geometry records of a `.shp` file
pub fn read_shapes(bytes: &[u8]) -> Result<Vec<Option<Geometry>>> {
    if bytes.len() < HEADER_LEN {
        return Err(malformed("file shorter than header"));
    }
    let mut header = Cursor::new(&bytes[..HEADER_LEN]);
    if header.read_i32::<BigEndian>()? != FILE_CODE {
        return Err(malformed("bad file code"));
    }
    header.set_position(24);
    let declared_len = header.read_i32::<BigEndian>()?.max(0) as usize * 2;
    let end = declared_len.min(bytes.len()).max(HEADER_LEN);

    let mut cursor = Cursor::new(&bytes[..end]);
    cursor.set_position(HEADER_LEN as u64);
    let mut shapes = Vec::new();

    while (cursor.position() as usize) + 8 <= end {
        let _record_number = cursor.read_i32::<BigEndian>()?;
        let content_len = cursor.read_i32::<BigEndian>()?.max(0) as usize * 2;
        let mut content = vec![0u8; content_len];
        cursor
            .read_exact(&mut content)
            .map_err(|_| malformed("truncated record"))?;
        shapes.push(parse_shape(&content)?);
    }
    Ok(shapes)
}

fn read_point(cursor: &mut Cursor<&[u8]>) -> Result<Position> {
    let x = cursor.read_f64::<LittleEndian>()?;
    let y = cursor.read_f64::<LittleEndian>()?;
    Ok(vec![x, y])
}

fn read_parts(cursor: &mut Cursor<&[u8]>) -> Result<Vec<Vec<Position>>> {
    cursor.set_position(cursor.position() + 32); // bounding box
    let num_parts = cursor.read_i32::<LittleEndian>()?.max(0) as usize;
    let num_points = cursor.read_i32::<LittleEndian>()?.max(0) as usize;
    let mut starts = Vec::with_capacity(num_parts);
    for _ in 0..num_parts {
        starts.push(cursor.read_i32::<LittleEndian>()?.max(0) as usize);
    }
    let mut points = Vec::with_capacity(num_points);
    for _ in 0..num_points {
        points.push(read_point(cursor)?);
    }

    let mut parts = Vec::with_capacity(num_parts);
    for (i, &start) in starts.iter().enumerate() {
        let stop = starts.get(i + 1).copied().unwrap_or(num_points);
        if start > stop || stop > num_points {
            return Err(malformed("part index out of range"));
        }
        parts.push(points[start..stop].to_vec());
    }
    Ok(parts)
}

fn parse_shape(content: &[u8]) -> Result<Option<Geometry>> {
    let mut cursor = Cursor::new(content);
    let shape_type = cursor.read_i32::<LittleEndian>()?;
    let geometry = match shape_type {
        0 => None,
        1 | 11 | 21 => Some(Geometry::Point {
            coordinates: read_point(&mut cursor)?,
        }),
        3 | 13 | 23 => {
            let mut parts = read_parts(&mut cursor)?;
            if parts.len() == 1 {
                Some(Geometry::LineString {
                    coordinates: parts.remove(0),
                })
            } else {
                Some(Geometry::MultiLineString { coordinates: parts })
            }
        }
        5 | 15 | 25 => {
            let mut polygons = group_rings(read_parts(&mut cursor)?);
            if polygons.len() == 1 {
                Some(Geometry::Polygon {
                    coordinates: polygons.remove(0),
                })
            } else {
                Some(Geometry::MultiPolygon {
                    coordinates: polygons,
                })
            }
        }
        8 | 18 | 28 => {
            cursor.set_position(cursor.position() + 32);
            let num_points = cursor.read_i32::<LittleEndian>()?.max(0) as usize;
            let mut points = Vec::with_capacity(num_points);
            for _ in 0..num_points {
                points.push(read_point(&mut cursor)?);
            }
            Some(Geometry::MultiPoint {
                coordinates: points,
            })
        }
        other => return Err(malformed(format!("unsupported shape type {}", other))),
    };
    Ok(geometry)
}

/// Twice the signed area; negative for clockwise rings
fn signed_area(ring: &[Position]) -> f64 {
    ring.windows(2)
        .map(|w| w[0][0] * w[1][1] - w[1][0] * w[0][1])
        .sum()
}

fn ring_bounds(ring: &[Position]) -> (f64, f64, f64, f64) {
    ring.iter().fold(
        (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        |(x0, y0, x1, y1), p| (x0.min(p[0]), y0.min(p[1]), x1.max(p[0]), y1.max(p[1])),
    )
}

/// Clockwise rings are exteriors; counter-clockwise rings are holes of the
/// exterior whose bounds contain them.
fn group_rings(rings: Vec<Vec<Position>>) -> Vec<Vec<Vec<Position>>> {
    let mut polygons: Vec<Vec<Vec<Position>>> = Vec::new();
    let mut holes = Vec::new();
    for ring in rings {
        if ring.is_empty() {
            continue;
        }
        if signed_area(&ring) <= 0.0 {
            polygons.push(vec![ring]);
        } else {
            holes.push(ring);
        }
    }

    for hole in holes {
        let probe = &hole[0];
        let owner = polygons.iter().position(|polygon| {
            let (x0, y0, x1, y1) = ring_bounds(&polygon[0]);
            probe[0] >= x0 && probe[0] <= x1 && probe[1] >= y0 && probe[1] <= y1
        });
        match owner {
            Some(index) => polygons[index].push(hole),
            None => polygons.push(vec![hole]),
        }
    }
    polygons
}

struct DbfField {
    name: String,
    kind: u8,
    length: usize,
    decimals: u8,
}

/// Parse the attribute records of a `.dbf` file
pub fn read_dbf(bytes: &[u8]) -> Result<Vec<Map<String, Value>>> {
    if bytes.len() < 32 {
        return Err(malformed("dbf shorter than header"));
    }
    let mut header = Cursor::new(bytes);
    header.set_position(4);
    let num_records = header.read_u32::<LittleEndian>()? as usize;
    let header_len = header.read_u16::<LittleEndian>()? as usize;
    let record_len = header.read_u16::<LittleEndian>()? as usize;

    let mut fields = Vec::new();
    let mut offset = 32;
    while offset + 32 <= bytes.len() && bytes[offset] != 0x0D {
        let descriptor = &bytes[offset..offset + 32];
        let name_end = descriptor[..11].iter().position(|&b| b == 0).unwrap_or(11);
        fields.push(DbfField {
            name: String::from_utf8_lossy(&descriptor[..name_end]).trim().to_string(),
            kind: descriptor[11],
            length: descriptor[16] as usize,
            decimals: descriptor[17],
        });
        offset += 32;
    }

    let mut records = Vec::with_capacity(num_records);
    for index in 0..num_records {
        let start = header_len + index * record_len;
        let Some(record) = bytes.get(start..start + record_len) else {
            break;
        };
        let mut properties = Map::new();
        let mut position = 1; // deletion flag
        for field in &fields {
            let raw = record.get(position..position + field.length).unwrap_or(&[]);
            properties.insert(field.name.clone(), decode_field(field, raw));
            position += field.length;
        }
        records.push(properties);
    }
    Ok(records)
}

fn decode_field(field: &DbfField, raw: &[u8]) -> Value {
    let text = String::from_utf8_lossy(raw).trim().trim_matches('\0').to_string();
    match field.kind {
        b'N' | b'F' => {
            if text.is_empty() || text.starts_with('*') {
                return Value::Null;
            }
            if field.decimals == 0 && !text.contains('.') {
                if let Ok(n) = text.parse::<i64>() {
                    return Value::Number(n.into());
                }
            }
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        b'L' => match text.chars().next() {
            Some('T' | 't' | 'Y' | 'y') => Value::Bool(true),
            Some('F' | 'f' | 'N' | 'n') => Value::Bool(false),
            _ => Value::Null,
        },
        b'D' => {
            if text.len() == 8 && text.chars().all(|c| c.is_ascii_digit()) {
                Value::String(format!("{}-{}-{}", &text[..4], &text[4..6], &text[6..]))
            } else if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            }
        }
        _ => Value::String(text),
    }
}
