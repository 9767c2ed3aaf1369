//! Microphone array geometry, and a reader for the XML geometry files that
//! acoular-style tooling writes:
//!
//! ```text
//! <?xml version="1.0" encoding="utf-8"?>
//! <MicArray name="array_16">
//!   <pos Name="Point 1" x="-0.063" y="0.063" z="0"/>
//!   ...
//! </MicArray>
//! ```
//!
//! Only the `x`, `y` and `z` attributes of each `<pos>` element matter, in
//! the order they appear; that order is the channel order.

use crate::error::LocatorError;
use crate::Position;

use nom::{
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, multispace0, multispace1},
    multi::many0,
    sequence::{delimited, preceded, separated_pair, tuple},
    Finish, IResult,
};

use std::{fs, path::Path};

/// Microphone positions in the station's local frame, in meters. The array
/// lies in the x/y plane and looks along +z.
#[derive(Debug, Clone, PartialEq)]
pub struct MicGeometry {
    positions: Vec<Position>,
}

type Attribute<'a> = (&'a str, &'a str);

fn parse_attribute(s: &str) -> IResult<&str, Attribute> {
    separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        tuple((multispace0, char('='), multispace0)),
        delimited(char('"'), take_until("\""), char('"')),
    )(s)
}

fn parse_pos_element(s: &str) -> IResult<&str, Vec<Attribute>> {
    delimited(
        tag("<pos"),
        many0(preceded(multispace1, parse_attribute)),
        preceded(multispace0, tag("/>")),
    )(s)
}

fn parse_pos_elements(s: &str) -> IResult<&str, Vec<Vec<Attribute>>> {
    many0(preceded(take_until("<pos"), parse_pos_element))(s)
}

fn coordinate(attrs: &[Attribute], axis: &str, index: usize) -> Result<f64, LocatorError> {
    let raw = attrs
        .iter()
        .find(|(name, _)| *name == axis)
        .map(|(_, value)| value.trim())
        .ok_or_else(|| LocatorError::Geometry(format!("microphone {} has no {}", index + 1, axis)))?;
    raw.parse::<f64>().map_err(|_| {
        LocatorError::Geometry(format!(
            "microphone {} has a bad {} value {:?}",
            index + 1,
            axis,
            raw
        ))
    })
}

impl MicGeometry {
    /// Builds a geometry from `[x, y, z]` microphone positions.
    pub fn from_positions(positions: &[[f64; 3]]) -> Result<Self, LocatorError> {
        if positions.is_empty() {
            return Err(LocatorError::Geometry("no microphones".to_owned()));
        }
        Ok(Self {
            positions: positions.iter().copied().map(crate::position).collect(),
        })
    }

    /// A 4 x 4 rectangular grid with a 42 mm pitch, centred on the origin:
    /// the layout of a miniDSP UMA-16 board.
    pub fn uma16() -> Self {
        let pitch = 0.042;
        let offset = 1.5 * pitch;
        let positions = (0..4)
            .flat_map(|row| {
                (0..4).map(move |col| {
                    Position::new(col as f64 * pitch - offset, offset - row as f64 * pitch, 0.0)
                })
            })
            .collect();
        Self { positions }
    }

    /// Parses the text of a geometry XML file.
    pub fn from_xml_str(s: &str) -> Result<Self, LocatorError> {
        let (remaining, elements) = parse_pos_elements(s)
            .finish()
            .map_err(|e| LocatorError::Geometry(format!("{:?} near {:?}", e.code, e.input)))?;
        if remaining.contains("<pos") {
            return Err(LocatorError::Geometry(format!(
                "malformed <pos> element after microphone {}",
                elements.len()
            )));
        }

        let positions = elements
            .iter()
            .enumerate()
            .map(|(i, attrs)| {
                Ok([
                    coordinate(attrs, "x", i)?,
                    coordinate(attrs, "y", i)?,
                    coordinate(attrs, "z", i)?,
                ])
            })
            .collect::<Result<Vec<_>, LocatorError>>()?;

        Self::from_positions(&positions)
    }

    /// Reads a geometry XML file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LocatorError> {
        Self::from_xml_str(&fs::read_to_string(path)?)
    }

    /// Number of microphones, which is also the channel count
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false; a geometry has at least one microphone
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Microphone positions in channel order
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// The mean microphone position
    pub fn center(&self) -> Position {
        self.positions.iter().sum::<Position>() / self.positions.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FOUR_MICS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MicArray name="square">
  <pos Name="Point 1" x="-0.05" y="0.05" z="0"/>
  <pos Name="Point 2" x="0.05"  y="0.05" z="0"/>
  <pos Name="Point 3" x="-0.05" y="-0.05" z="0"/>
  <pos  z="0.01" y="-0.05" x="0.05" Name="Point 4" />
</MicArray>
"#;

    #[test]
    fn test_parse_four_mics() {
        let geom = MicGeometry::from_xml_str(FOUR_MICS).unwrap();
        assert_eq!(geom.len(), 4);
        assert_eq!(geom.positions()[0], Position::new(-0.05, 0.05, 0.0));
        assert_eq!(geom.positions()[3], Position::new(0.05, -0.05, 0.01));
    }

    #[test]
    fn test_attribute() {
        let (rest, attr) = parse_attribute(r#"x = "1.5"/>"#).unwrap();
        assert_eq!(attr, ("x", "1.5"));
        assert_eq!(rest, "/>");
    }

    #[test]
    fn test_missing_coordinate() {
        let xml = r#"<MicArray><pos Name="a" x="0" y="0"/></MicArray>"#;
        let err = MicGeometry::from_xml_str(xml).unwrap_err();
        assert_eq!(err.to_string(), "geometry error: microphone 1 has no z");
    }

    #[test]
    fn test_bad_number() {
        let xml = r#"<MicArray><pos x="0" y="zero" z="0"/></MicArray>"#;
        assert!(matches!(
            MicGeometry::from_xml_str(xml),
            Err(LocatorError::Geometry(_))
        ));
    }

    #[test]
    fn test_unterminated_element() {
        let xml = r#"<MicArray><pos x="0" y="0" z="0"/><pos x="1" y="0" z="0"></MicArray>"#;
        assert!(matches!(
            MicGeometry::from_xml_str(xml),
            Err(LocatorError::Geometry(_))
        ));
    }

    #[test]
    fn test_no_mics() {
        assert!(MicGeometry::from_xml_str("<MicArray></MicArray>").is_err());
    }

    #[test]
    fn test_uma16_is_centred() {
        let geom = MicGeometry::uma16();
        assert_eq!(geom.len(), 16);
        assert!(geom.center().norm() < 1e-12);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FOUR_MICS.as_bytes()).unwrap();
        let geom = MicGeometry::from_path(file.path()).unwrap();
        assert_eq!(geom.len(), 4);
    }
}
