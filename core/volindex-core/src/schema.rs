use tantivy::schema::{Field, NumericOptions, Schema, SchemaBuilder, STORED, STRING, TEXT};

use crate::error::{IndexError, Result};

pub const PATH: &str = "path";
pub const NAME: &str = "name";
pub const NAME_RAW: &str = "name_raw";
pub const EXT: &str = "ext";
pub const MTIME: &str = "mtime";
pub const SIZE: &str = "size";
pub const CONTENTS: &str = "contents";

/// `path` is the document key: untokenized so a term matches exactly one file.
pub fn build_schema() -> Schema {
    let mut builder = SchemaBuilder::default();

    builder.add_text_field(PATH, STRING | STORED);
    builder.add_text_field(NAME, TEXT | STORED);
    builder.add_text_field(NAME_RAW, STRING);
    builder.add_text_field(EXT, STRING);

    let mtime = NumericOptions::default().set_stored().set_fast();
    builder.add_i64_field(MTIME, mtime);

    let size = NumericOptions::default().set_stored().set_fast();
    builder.add_u64_field(SIZE, size);

    builder.add_text_field(CONTENTS, TEXT);

    builder.build()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexFields {
    pub path: Field,
    pub name: Field,
    pub name_raw: Field,
    pub ext: Field,
    pub mtime: Field,
    pub size: Field,
    pub contents: Field,
}

impl IndexFields {
    pub fn resolve(schema: &Schema) -> Result<Self> {
        Ok(Self {
            path: field(schema, PATH)?,
            name: field(schema, NAME)?,
            name_raw: field(schema, NAME_RAW)?,
            ext: field(schema, EXT)?,
            mtime: field(schema, MTIME)?,
            size: field(schema, SIZE)?,
            contents: field(schema, CONTENTS)?,
        })
    }
}

fn field(schema: &Schema, name: &str) -> Result<Field> {
    schema
        .get_field(name)
        .map_err(|err| IndexError::engine("resolve schema", format!("field {name}: {err}")))
}
