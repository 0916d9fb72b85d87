/// Fixed-width primitive and out-of-line variable-sized field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Char,
    /// Out-of-line field: the fixed-width slot holds a [`crate::ChildKey`]
    /// pointing at the child segment that owns the actual bytes.
    VarSized,
}

impl FieldType {
    /// Width of the fixed-width slot this field occupies in the row layout.
    /// For `VarSized` this is the width of the child-key reference, not the
    /// referenced payload.
    pub fn fixed_width(self) -> usize {
        match self {
            FieldType::I8 | FieldType::U8 | FieldType::Bool | FieldType::Char => 1,
            FieldType::I16 | FieldType::U16 => 2,
            FieldType::I32 | FieldType::U32 | FieldType::F32 => 4,
            FieldType::I64 | FieldType::U64 | FieldType::F64 | FieldType::VarSized => 8,
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    ty: FieldType,
    offset: usize,
}

/// An ordered, named list of fields describing one row's layout.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<Field>,
    row_size: usize,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_type(&self, index: usize) -> Option<FieldType> {
        self.fields.get(index).map(|f| f.ty)
    }

    pub fn field_offset(&self, index: usize) -> Option<usize> {
        self.fields.get(index).map(|f| f.offset)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn has_var_sized_fields(&self) -> bool {
        self.fields.iter().any(|f| f.ty == FieldType::VarSized)
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    fields: Vec<(String, FieldType)>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    pub fn build(self) -> Schema {
        let mut offset = 0;
        let fields = self
            .fields
            .into_iter()
            .map(|(name, ty)| {
                let field = Field {
                    name,
                    ty,
                    offset,
                };
                offset += ty.fixed_width();
                field
            })
            .collect();
        Schema {
            fields,
            row_size: offset,
        }
    }
}
