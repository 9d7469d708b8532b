//! Class-file assembly: constant pool, per-method bytecode builders, and
//! the final single-pass serialization.

pub mod code;
pub mod constant_pool;
pub mod op;

use crate::error::CompileError;

pub use code::{CodeBuilder, ExceptionRange, Label, MethodCode};
pub use constant_pool::ConstantPool;
pub use op::Op;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;

const MAGIC: u32 = 0xCAFE_BABE;
/// Java 5 format: no StackMapTable attribute is required, which keeps
/// generated control flow free of frame bookkeeping.
const MAJOR_VERSION: u16 = 49;
const MINOR_VERSION: u16 = 0;

/// A class-level annotation element value.
#[derive(Debug, Clone)]
pub enum AnnotationValue {
    Int(i32),
    Long(i64),
    Str(String),
}

/// One runtime-visible class annotation.
#[derive(Debug, Clone)]
pub struct Annotation {
    /// Field descriptor form, e.g. `Ljavelin/runtime/APIVersion;`.
    pub type_descriptor: String,
    pub elements: Vec<(String, AnnotationValue)>,
}

#[derive(Debug)]
struct FieldDecl {
    access: u16,
    name: String,
    descriptor: String,
}

#[derive(Debug)]
struct MethodDecl {
    access: u16,
    name: String,
    descriptor: String,
    code: MethodCode,
}

/// Accumulates one generated class and serializes it.
#[derive(Debug)]
pub struct ClassBuilder {
    pool: ConstantPool,
    name: String,
    super_name: String,
    interfaces: Vec<String>,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodDecl>,
    annotations: Vec<Annotation>,
    source_file: Option<String>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        Self {
            pool: ConstantPool::new(),
            name: name.to_string(),
            super_name: super_name.to_string(),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            annotations: Vec::new(),
            source_file: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared constant pool; method bodies intern their references
    /// here while being built.
    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    /// Declares an implemented interface by internal-form name.
    pub fn add_interface(&mut self, name: &str) {
        self.interfaces.push(name.to_string());
    }

    pub fn add_field(&mut self, access: u16, name: &str, descriptor: &str) {
        self.fields.push(FieldDecl {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
    }

    pub fn add_method(&mut self, access: u16, name: &str, descriptor: &str, code: MethodCode) {
        self.methods.push(MethodDecl {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code,
        });
    }

    pub fn add_annotation(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    pub fn set_source_file(&mut self, name: &str) {
        self.source_file = Some(name.to_string());
    }

    /// Serializes the class. The body is rendered first so every late
    /// constant-pool entry exists before the pool itself is written.
    pub fn finish(mut self) -> Result<Vec<u8>, CompileError> {
        let this_class = self.pool.class(&self.name)?;
        let super_class = self.pool.class(&self.super_name)?;

        let mut body = Vec::new();
        body.extend_from_slice(&(ACC_PUBLIC | ACC_SUPER).to_be_bytes());
        body.extend_from_slice(&this_class.to_be_bytes());
        body.extend_from_slice(&super_class.to_be_bytes());
        body.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        let interfaces = std::mem::take(&mut self.interfaces);
        for interface in &interfaces {
            let idx = self.pool.class(interface)?;
            body.extend_from_slice(&idx.to_be_bytes());
        }

        body.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        let fields = std::mem::take(&mut self.fields);
        for field in &fields {
            let name_idx = self.pool.utf8(&field.name)?;
            let desc_idx = self.pool.utf8(&field.descriptor)?;
            body.extend_from_slice(&field.access.to_be_bytes());
            body.extend_from_slice(&name_idx.to_be_bytes());
            body.extend_from_slice(&desc_idx.to_be_bytes());
            body.extend_from_slice(&0u16.to_be_bytes());
        }

        body.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        let methods = std::mem::take(&mut self.methods);
        for method in &methods {
            self.write_method(&mut body, method)?;
        }

        let mut class_attrs: Vec<Vec<u8>> = Vec::new();
        if let Some(source) = self.source_file.take() {
            let name_idx = self.pool.utf8("SourceFile")?;
            let value_idx = self.pool.utf8(&source)?;
            let mut attr = Vec::new();
            attr.extend_from_slice(&name_idx.to_be_bytes());
            attr.extend_from_slice(&2u32.to_be_bytes());
            attr.extend_from_slice(&value_idx.to_be_bytes());
            class_attrs.push(attr);
        }
        if !self.annotations.is_empty() {
            class_attrs.push(self.write_annotations()?);
        }
        body.extend_from_slice(&(class_attrs.len() as u16).to_be_bytes());
        for attr in &class_attrs {
            body.extend_from_slice(attr);
        }

        let mut out = Vec::with_capacity(body.len() + 1024);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&MINOR_VERSION.to_be_bytes());
        out.extend_from_slice(&MAJOR_VERSION.to_be_bytes());
        self.pool.write(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn write_method(&mut self, body: &mut Vec<u8>, method: &MethodDecl) -> Result<(), CompileError> {
        let name_idx = self.pool.utf8(&method.name)?;
        let desc_idx = self.pool.utf8(&method.descriptor)?;
        body.extend_from_slice(&method.access.to_be_bytes());
        body.extend_from_slice(&name_idx.to_be_bytes());
        body.extend_from_slice(&desc_idx.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());

        let code_name_idx = self.pool.utf8("Code")?;
        let code = &method.code;

        let mut line_attr = Vec::new();
        if !code.line_numbers.is_empty() {
            let line_name_idx = self.pool.utf8("LineNumberTable")?;
            line_attr.extend_from_slice(&line_name_idx.to_be_bytes());
            let length = 2 + 4 * code.line_numbers.len() as u32;
            line_attr.extend_from_slice(&length.to_be_bytes());
            line_attr.extend_from_slice(&(code.line_numbers.len() as u16).to_be_bytes());
            for &(pc, line) in &code.line_numbers {
                line_attr.extend_from_slice(&pc.to_be_bytes());
                line_attr.extend_from_slice(&line.to_be_bytes());
            }
        }

        let mut attr = Vec::new();
        attr.extend_from_slice(&code.max_stack.to_be_bytes());
        attr.extend_from_slice(&code.max_locals.to_be_bytes());
        attr.extend_from_slice(&(code.code.len() as u32).to_be_bytes());
        attr.extend_from_slice(&code.code);
        attr.extend_from_slice(&(code.exceptions.len() as u16).to_be_bytes());
        for &(start, end, handler, catch_type) in &code.exceptions {
            attr.extend_from_slice(&start.to_be_bytes());
            attr.extend_from_slice(&end.to_be_bytes());
            attr.extend_from_slice(&handler.to_be_bytes());
            attr.extend_from_slice(&catch_type.to_be_bytes());
        }
        attr.extend_from_slice(&u16::from(!line_attr.is_empty()).to_be_bytes());
        attr.extend_from_slice(&line_attr);

        body.extend_from_slice(&code_name_idx.to_be_bytes());
        body.extend_from_slice(&(attr.len() as u32).to_be_bytes());
        body.extend_from_slice(&attr);
        Ok(())
    }

    fn write_annotations(&mut self) -> Result<Vec<u8>, CompileError> {
        let name_idx = self.pool.utf8("RuntimeVisibleAnnotations")?;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.annotations.len() as u16).to_be_bytes());
        let annotations = std::mem::take(&mut self.annotations);
        for annotation in &annotations {
            let type_idx = self.pool.utf8(&annotation.type_descriptor)?;
            payload.extend_from_slice(&type_idx.to_be_bytes());
            payload.extend_from_slice(&(annotation.elements.len() as u16).to_be_bytes());
            for (element, value) in &annotation.elements {
                let element_idx = self.pool.utf8(element)?;
                payload.extend_from_slice(&element_idx.to_be_bytes());
                match value {
                    AnnotationValue::Int(v) => {
                        let const_idx = self.pool.integer(*v)?;
                        payload.push(b'I');
                        payload.extend_from_slice(&const_idx.to_be_bytes());
                    }
                    AnnotationValue::Long(v) => {
                        let const_idx = self.pool.long(*v)?;
                        payload.push(b'J');
                        payload.extend_from_slice(&const_idx.to_be_bytes());
                    }
                    AnnotationValue::Str(v) => {
                        let const_idx = self.pool.utf8(v)?;
                        payload.push(b's');
                        payload.extend_from_slice(&const_idx.to_be_bytes());
                    }
                }
            }
        }
        let mut attr = Vec::new();
        attr.extend_from_slice(&name_idx.to_be_bytes());
        attr.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        attr.extend_from_slice(&payload);
        Ok(attr)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn empty_method() -> MethodCode {
        let mut code = CodeBuilder::new(1);
        code.emit_return();
        code.finish().unwrap()
    }

    #[test]
    fn header_is_cafebabe_version_49() {
        let mut builder = ClassBuilder::new("demo$py", "javelin/runtime/FunctionTable");
        let method = empty_method();
        builder.add_method(ACC_PUBLIC | ACC_STATIC, "module$0", "()V", method);
        let bytes = builder.finish().unwrap();
        assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(&bytes[4..6], &[0, 0]);
        assert_eq!(&bytes[6..8], &[0, 49]);
    }

    #[test]
    fn serialization_is_deterministic() {
        let build = || {
            let mut builder = ClassBuilder::new("demo$py", "javelin/runtime/FunctionTable");
            builder.add_field(ACC_PRIVATE | ACC_STATIC | ACC_FINAL, "k$0", "Ljavelin/runtime/Value;");
            builder.set_source_file("demo.py");
            builder.add_annotation(Annotation {
                type_descriptor: "Ljavelin/runtime/APIVersion;".to_string(),
                elements: vec![("value".to_string(), AnnotationValue::Int(2))],
            });
            let method = empty_method();
            builder.add_method(ACC_PUBLIC | ACC_STATIC, "module$0", "()V", method);
            builder.finish().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn interfaces_are_listed_after_the_super_class() {
        let mut builder = ClassBuilder::new("proxy$py", "java/lang/Object");
        builder.add_interface("java/io/Serializable");
        builder.add_interface("java/lang/Runnable");
        let method = empty_method();
        builder.add_method(ACC_PUBLIC, "<init>", "()V", method);
        let bytes = builder.finish().unwrap();
        let haystack = bytes.as_slice();
        for needle in [b"java/io/Serializable".as_slice(), b"java/lang/Runnable"] {
            assert!(
                haystack.windows(needle.len()).any(|w| w == needle),
                "missing {:?}",
                String::from_utf8_lossy(needle)
            );
        }

        let mut plain = ClassBuilder::new("proxy$py", "java/lang/Object");
        plain.add_method(ACC_PUBLIC, "<init>", "()V", empty_method());
        // Two extra class entries and their names widen the class file.
        assert!(bytes.len() > plain.finish().unwrap().len());
    }

    #[test]
    fn source_file_and_annotations_are_attached() {
        let mut builder = ClassBuilder::new("demo$py", "java/lang/Object");
        builder.set_source_file("demo.py");
        builder.add_annotation(Annotation {
            type_descriptor: "Ljavelin/runtime/MTime;".to_string(),
            elements: vec![("value".to_string(), AnnotationValue::Long(1_700_000_000))],
        });
        let method = empty_method();
        builder.add_method(ACC_PUBLIC, "<init>", "()V", method);
        let bytes = builder.finish().unwrap();
        let haystack = bytes.as_slice();
        for needle in [b"SourceFile".as_slice(), b"RuntimeVisibleAnnotations", b"demo.py", b"Ljavelin/runtime/MTime;"] {
            assert!(
                haystack.windows(needle.len()).any(|w| w == needle),
                "missing {:?}",
                String::from_utf8_lossy(needle)
            );
        }
    }
}
