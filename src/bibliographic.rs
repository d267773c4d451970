//! Building minimal bibliographic records from discrete metadata.
//!
//! [`build`] turns a [`BibliographicData`] into ISO 2709 bytes. Every element it
//! sets is read back unchanged by the [`Record`] accessors, so
//! `BibliographicData::from_record(&parse(&build(profile, &data)?)?) == data`
//! for any data whose strings contain no MARC delimiter bytes.
//!
//! # Examples
//!
//! ```
//! use fedcat::bibliographic::{build, BibliographicData, CatalogingProfile};
//! use fedcat::reader::parse;
//!
//! let data = BibliographicData {
//!     id: "b1".to_string(),
//!     title: "Server Test Title".to_string(),
//!     author: "Author".to_string(),
//!     isbn: "ISBN".to_string(),
//!     publisher: "Pub".to_string(),
//!     year: "2024".to_string(),
//!     ..BibliographicData::default()
//! };
//! let bytes = build(CatalogingProfile::Aacr2, &data)?;
//! let record = parse(&bytes)?;
//! assert_eq!(record.title(), "Server Test Title");
//! assert_eq!(record.year(), "2024");
//! # Ok::<(), fedcat::MarcError>(())
//! ```

use crate::error::Result;
use crate::leader::Leader;
use crate::record::{Field, Record};
use crate::writer::to_bytes;
use serde::{Deserialize, Serialize};

/// Cataloging convention used when laying out a built record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogingProfile {
    /// AACR2: imprint in 260, leader/18 = 'a'
    #[default]
    Aacr2,
    /// RDA: publication statement in 264 _1, content/media/carrier in 336-338,
    /// leader/18 = 'i'
    Rda,
}

/// Discrete bibliographic metadata for one record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BibliographicData {
    /// Control number (001)
    pub id: String,
    /// Title proper (245 $a)
    pub title: String,
    /// Main entry personal name (100 $a)
    pub author: String,
    /// ISBN (020 $a)
    pub isbn: String,
    /// Publisher name (260/264 $b)
    pub publisher: String,
    /// Date of publication (260/264 $c)
    pub year: String,
    /// Edition statement (250 $a)
    pub edition: String,
    /// MARC language code (008/35-37)
    pub language: String,
    /// Topical subjects (650 $a), empty entries are dropped
    pub subjects: Vec<String>,
}

impl BibliographicData {
    /// Read the elements [`build`] sets back out of a record.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        BibliographicData {
            id: record.id().to_string(),
            title: record.title().to_string(),
            author: record.author().to_string(),
            isbn: record.isbn().to_string(),
            publisher: record.publisher().to_string(),
            year: record.year().to_string(),
            edition: record.edition().to_string(),
            language: record.language().to_string(),
            subjects: record.subjects().into_iter().map(str::to_string).collect(),
        }
    }
}

/// Assemble a [`Record`] for `data` without serializing it.
#[must_use]
pub fn to_record(profile: CatalogingProfile, data: &BibliographicData) -> Record {
    let leader = Leader {
        cataloging_form: match profile {
            CatalogingProfile::Aacr2 => 'a',
            CatalogingProfile::Rda => 'i',
        },
        ..Leader::default()
    };
    let mut record = Record::new(leader);

    if !data.id.is_empty() {
        record.add_control_field_str("001", &data.id);
    }
    record.add_control_field("008".to_string(), fixed_length_data(data));

    if !data.isbn.is_empty() {
        record.add_field(single("020", ' ', ' ', 'a', &data.isbn));
    }
    if profile == CatalogingProfile::Rda {
        record.add_field(single("040", ' ', ' ', 'e', "rda"));
    }
    if !data.author.is_empty() {
        record.add_field(single("100", '1', ' ', 'a', &data.author));
    }
    if !data.title.is_empty() {
        let ind1 = if data.author.is_empty() { '0' } else { '1' };
        record.add_field(single("245", ind1, '0', 'a', &data.title));
    }
    if !data.edition.is_empty() {
        record.add_field(single("250", ' ', ' ', 'a', &data.edition));
    }
    if !data.publisher.is_empty() || !data.year.is_empty() {
        let mut imprint = match profile {
            CatalogingProfile::Aacr2 => Field::new("260".to_string(), ' ', ' '),
            CatalogingProfile::Rda => Field::new("264".to_string(), ' ', '1'),
        };
        if !data.publisher.is_empty() {
            imprint.add_subfield_str('b', &data.publisher);
        }
        if !data.year.is_empty() {
            imprint.add_subfield_str('c', &data.year);
        }
        record.add_field(imprint);
    }
    if profile == CatalogingProfile::Rda {
        for (tag, term, code, source) in [
            ("336", "text", "txt", "rdacontent"),
            ("337", "unmediated", "n", "rdamedia"),
            ("338", "volume", "nc", "rdacarrier"),
        ] {
            record.add_field(
                Field::builder(tag.to_string(), ' ', ' ')
                    .subfield_str('a', term)
                    .subfield_str('b', code)
                    .subfield_str('2', source)
                    .build(),
            );
        }
    }
    for subject in data.subjects.iter().filter(|s| !s.is_empty()) {
        record.add_field(single("650", ' ', '4', 'a', subject));
    }

    record
}

/// Build a minimal bibliographic record and serialize it to ISO 2709.
///
/// Directory offsets and the leader's length fields are computed from the
/// serialized size.
///
/// # Errors
///
/// Returns an error if the record would exceed ISO 2709 size limits.
pub fn build(profile: CatalogingProfile, data: &BibliographicData) -> Result<Vec<u8>> {
    to_bytes(&to_record(profile, data))
}

fn single(tag: &str, ind1: char, ind2: char, code: char, value: &str) -> Field {
    Field::builder(tag.to_string(), ind1, ind2)
        .subfield_str(code, value)
        .build()
}

// 008 for books: date entered, date type + date1, place, language, source.
fn fixed_length_data(data: &BibliographicData) -> String {
    let four_digit_year = data.year.len() == 4 && data.year.chars().all(|c| c.is_ascii_digit());
    let (date_type, date1) = if four_digit_year {
        ('s', data.year.as_str())
    } else {
        ('n', "uuuu")
    };
    let language = if data.language.len() == 3 && data.language.is_ascii() {
        data.language.as_str()
    } else {
        "   "
    };
    format!("000000{date_type}{date1}    xx {:17}{language} d", "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::parse;

    fn sample() -> BibliographicData {
        BibliographicData {
            id: "rec-100".to_string(),
            title: "A Wizard of Earthsea".to_string(),
            author: "Le Guin, Ursula K.".to_string(),
            isbn: "9780547773742".to_string(),
            publisher: "Parnassus Press".to_string(),
            year: "1968".to_string(),
            edition: "1st ed.".to_string(),
            language: "eng".to_string(),
            subjects: vec!["Wizards".to_string(), "Fantasy fiction".to_string()],
        }
    }

    #[test]
    fn test_roundtrip_aacr2() {
        let data = sample();
        let record = parse(&build(CatalogingProfile::Aacr2, &data).unwrap()).unwrap();
        assert_eq!(BibliographicData::from_record(&record), data);
        assert!(record.get_field("260").is_some());
        assert_eq!(record.leader.cataloging_form, 'a');
    }

    #[test]
    fn test_roundtrip_rda() {
        let data = sample();
        let record = parse(&build(CatalogingProfile::Rda, &data).unwrap()).unwrap();
        assert_eq!(BibliographicData::from_record(&record), data);
        assert!(record.get_field("260").is_none());
        assert_eq!(record.get_field("264").unwrap().indicator2, '1');
        assert!(record.get_field("336").is_some());
        assert_eq!(record.leader.cataloging_form, 'i');
    }

    #[test]
    fn test_fixed_length_data_layout() {
        let field = fixed_length_data(&sample());
        assert_eq!(field.len(), 40);
        assert_eq!(&field[6..11], "s1968");
        assert_eq!(&field[35..38], "eng");
    }

    #[test]
    fn test_empty_elements_omitted() {
        let data = BibliographicData {
            title: "Only a title".to_string(),
            ..BibliographicData::default()
        };
        let record = to_record(CatalogingProfile::Aacr2, &data);
        let tags: Vec<&str> = record.fields().map(|f| f.tag.as_str()).collect();
        assert_eq!(tags, vec!["245"]);
        assert_eq!(record.get_field("245").unwrap().indicator1, '0');

        let parsed = parse(&build(CatalogingProfile::Aacr2, &data).unwrap()).unwrap();
        assert_eq!(BibliographicData::from_record(&parsed), data);
    }

    #[test]
    fn test_non_numeric_year_kept_in_imprint() {
        let data = BibliographicData {
            year: "c1999".to_string(),
            ..BibliographicData::default()
        };
        let record = parse(&build(CatalogingProfile::Aacr2, &data).unwrap()).unwrap();
        assert_eq!(record.year(), "c1999");
        assert_eq!(&record.get_control_field("008").unwrap()[6..11], "nuuuu");
    }
}
