//! MARC bibliographic record structures and accessors.
//!
//! This module provides the record types produced by the ISO 2709 codec:
//! - [`Record`]: leader plus ordered control and data fields
//! - [`ControlField`]: fields 001-009, undifferentiated text
//! - [`Field`]: variable data fields (010+) with indicators
//! - [`Subfield`]: coded data elements within a data field
//!
//! Fields are kept in explicit ordered sequences. The writer emits them in the
//! order they were added, so a record round-trips through the codec with its
//! field order intact.
//!
//! # Examples
//!
//! ```
//! use fedcat::{Field, Leader, Record};
//!
//! let record = Record::builder(Leader::default())
//!     .control_field_str("001", "ocm12345")
//!     .field(
//!         Field::builder("245".to_string(), '1', '0')
//!             .subfield_str('a', "The Left Hand of Darkness")
//!             .build(),
//!     )
//!     .build();
//!
//! assert_eq!(record.id(), "ocm12345");
//! assert_eq!(record.title(), "The Left Hand of Darkness");
//! assert_eq!(record.isbn(), "");
//! ```

use crate::leader::Leader;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A MARC bibliographic record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record leader (24 bytes)
    pub leader: Leader,
    /// Control fields (001-009) in emission order
    pub control_fields: Vec<ControlField>,
    /// Data fields (010+) in emission order
    pub fields: Vec<Field>,
}

/// A control field (001-009); its content is not split into subfields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlField {
    /// Field tag (3 digits, starting with "00")
    pub tag: String,
    /// Field content without the terminator
    pub value: String,
}

/// A data field in a MARC record (fields 010 and higher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field tag (3 characters)
    pub tag: String,
    /// First indicator
    pub indicator1: char,
    /// Second indicator
    pub indicator2: char,
    /// Subfields (stored in `SmallVec` to avoid allocation for typical fields with 4 or fewer subfields)
    pub subfields: SmallVec<[Subfield; 4]>,
}

/// A subfield within a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subfield {
    /// Subfield code (single character)
    pub code: char,
    /// Subfield value
    pub value: String,
}

/// True for tags that carry control-field content ("00" prefix).
#[must_use]
pub fn is_control_tag(tag: &str) -> bool {
    tag.len() == 3 && tag.starts_with("00")
}

impl Record {
    /// Create a new MARC record with the given leader
    #[must_use]
    pub fn new(leader: Leader) -> Self {
        Record {
            leader,
            control_fields: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Create a builder for fluently constructing MARC records
    #[must_use]
    pub fn builder(leader: Leader) -> RecordBuilder {
        RecordBuilder {
            record: Record::new(leader),
        }
    }

    /// Append a control field (001-009)
    pub fn add_control_field(&mut self, tag: String, value: String) {
        self.control_fields.push(ControlField { tag, value });
    }

    /// Append a control field using string slices
    pub fn add_control_field_str(&mut self, tag: &str, value: &str) {
        self.add_control_field(tag.to_string(), value.to_string());
    }

    /// Get the first control field value with a given tag
    #[must_use]
    pub fn get_control_field(&self, tag: &str) -> Option<&str> {
        self.control_fields
            .iter()
            .find(|f| f.tag == tag)
            .map(|f| f.value.as_str())
    }

    /// Append a data field
    pub fn add_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Get first field with a given tag
    #[must_use]
    pub fn get_field(&self, tag: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    /// Iterate over all data fields in record order
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Iterate over data fields matching a specific tag
    pub fn fields_by_tag<'a, 'b>(&'a self, tag: &'b str) -> impl Iterator<Item = &'a Field> + 'b
    where
        'a: 'b,
    {
        self.fields.iter().filter(move |f| f.tag == tag)
    }

    // ============================================================================
    // Bibliographic accessors
    //
    // Each returns "" when the element is absent. Search results are handed to
    // presentation layers that expect plain strings.
    // ============================================================================

    /// Record identifier from control field 001
    #[must_use]
    pub fn id(&self) -> &str {
        self.get_control_field("001").unwrap_or("")
    }

    /// Title proper from 245 $a
    #[must_use]
    pub fn title(&self) -> &str {
        self.subfield_of("245", 'a')
    }

    /// Main entry from 100 $a, falling back to 110 $a and then the first 700 $a
    #[must_use]
    pub fn author(&self) -> &str {
        ["100", "110", "700"]
            .iter()
            .map(|tag| self.subfield_of(tag, 'a'))
            .find(|v| !v.is_empty())
            .unwrap_or("")
    }

    /// First ISBN from 020 $a
    #[must_use]
    pub fn isbn(&self) -> &str {
        self.subfield_of("020", 'a')
    }

    /// Publisher from 264 $b (publication statement), falling back to 260 $b
    #[must_use]
    pub fn publisher(&self) -> &str {
        self.publication_subfield('b')
    }

    /// Publication date from 264 $c or 260 $c, falling back to 008/07-10
    #[must_use]
    pub fn year(&self) -> &str {
        let date = self.publication_subfield('c');
        if !date.is_empty() {
            return date;
        }
        self.get_control_field("008")
            .and_then(|f| f.get(7..11))
            .filter(|y| y.chars().all(|c| c.is_ascii_digit()) && *y != "0000")
            .unwrap_or("")
    }

    /// Edition statement from 250 $a
    #[must_use]
    pub fn edition(&self) -> &str {
        self.subfield_of("250", 'a')
    }

    /// Topical subject headings from every 650 $a
    #[must_use]
    pub fn subjects(&self) -> Vec<&str> {
        self.fields_by_tag("650")
            .filter_map(|f| f.get_subfield('a'))
            .collect()
    }

    /// Language code from 008/35-37
    #[must_use]
    pub fn language(&self) -> &str {
        self.get_control_field("008")
            .and_then(|f| f.get(35..38))
            .filter(|lang| lang.trim().len() == 3)
            .unwrap_or("")
    }

    fn subfield_of(&self, tag: &str, code: char) -> &str {
        self.fields
            .iter()
            .filter(|f| f.tag == tag)
            .find_map(|f| f.get_subfield(code))
            .unwrap_or("")
    }

    // 264 with second indicator 1 is the RDA publication statement; other 264s
    // record production, distribution or manufacture.
    fn publication_subfield(&self, code: char) -> &str {
        self.fields
            .iter()
            .filter(|f| f.tag == "264" && f.indicator2 == '1')
            .find_map(|f| f.get_subfield(code))
            .or_else(|| {
                self.fields
                    .iter()
                    .filter(|f| f.tag == "260")
                    .find_map(|f| f.get_subfield(code))
            })
            .unwrap_or("")
    }
}

/// Builder for fluently constructing MARC records
#[derive(Debug)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    /// Add a control field using string slices
    #[must_use]
    pub fn control_field_str(mut self, tag: &str, value: &str) -> Self {
        self.record.add_control_field_str(tag, value);
        self
    }

    /// Add a data field
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.record.add_field(field);
        self
    }

    /// Build the record
    #[must_use]
    pub fn build(self) -> Record {
        self.record
    }
}

impl Field {
    /// Create a new data field
    #[must_use]
    pub fn new(tag: String, indicator1: char, indicator2: char) -> Self {
        Field {
            tag,
            indicator1,
            indicator2,
            subfields: SmallVec::new(),
        }
    }

    /// Create a builder for fluently constructing fields
    #[must_use]
    pub fn builder(tag: String, indicator1: char, indicator2: char) -> FieldBuilder {
        FieldBuilder {
            field: Field::new(tag, indicator1, indicator2),
        }
    }

    /// Append a subfield
    pub fn add_subfield(&mut self, code: char, value: String) {
        self.subfields.push(Subfield { code, value });
    }

    /// Append a subfield using a string slice
    pub fn add_subfield_str(&mut self, code: char, value: &str) {
        self.add_subfield(code, value.to_string());
    }

    /// Get the first subfield value with a given code
    #[must_use]
    pub fn get_subfield(&self, code: char) -> Option<&str> {
        self.subfields
            .iter()
            .find(|s| s.code == code)
            .map(|s| s.value.as_str())
    }

    /// Get all subfield values with a given code
    #[must_use]
    pub fn get_subfield_values(&self, code: char) -> Vec<&str> {
        self.subfields_by_code(code).collect()
    }

    /// Iterate over subfield values with a given code
    pub fn subfields_by_code(&self, code: char) -> impl Iterator<Item = &str> {
        self.subfields
            .iter()
            .filter(move |s| s.code == code)
            .map(|s| s.value.as_str())
    }

    /// All subfield values joined with single spaces
    #[must_use]
    pub fn value(&self) -> String {
        self.subfields
            .iter()
            .map(|s| s.value.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builder for fluently constructing data fields
#[derive(Debug)]
pub struct FieldBuilder {
    field: Field,
}

impl FieldBuilder {
    /// Add a subfield
    #[must_use]
    pub fn subfield(mut self, code: char, value: String) -> Self {
        self.field.add_subfield(code, value);
        self
    }

    /// Add a subfield using a string slice
    #[must_use]
    pub fn subfield_str(mut self, code: char, value: &str) -> Self {
        self.field.add_subfield_str(code, value);
        self
    }

    /// Build the field
    #[must_use]
    pub fn build(self) -> Field {
        self.field
    }
}
