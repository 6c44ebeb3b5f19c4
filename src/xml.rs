//! Owned element tree for outbound documents, and the single libxml entry
//! point for inbound ones.
//!
//! Documents issued by the IdP are assembled as [`Element`] values and
//! serialized once. Everything received from the outside is parsed by
//! [`parse_document`] and read through libxml nodes only.

use libxml::{
    parser::{Parser as XmlParser, ParserOptions},
    tree::{Document, Node, NodeType},
};
use quick_xml::escape::escape;

use crate::{SamlError, SamlResult};

pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
}

impl QName {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((prefix, local)) => QName {
                prefix: Some(prefix.to_string()),
                local: local.to_string(),
            },
            None => QName {
                prefix: None,
                local: raw.to_string(),
            },
        }
    }

    pub fn qualified(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local),
            None => self.local.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: QName,
    pub namespaces: Vec<NamespaceDecl>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<XmlNode>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Element {
            name: QName::parse(name),
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, prefix: Option<&str>, uri: &str) -> Self {
        self.namespaces.push(NamespaceDecl {
            prefix: prefix.map(str::to_string),
            uri: uri.to_string(),
        });
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let name = QName::parse(name);
        let value = value.into();
        match self.attributes.iter_mut().find(|attr| attr.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }

    /// Replaces all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![XmlNode::Text(text.into())];
    }

    /// Value of an unqualified attribute.
    pub fn attribute(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name.prefix.is_none() && attr.name.local == local)
            .map(|attr| attr.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|child| match child {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    pub fn to_document(&self) -> String {
        let mut out = String::from(XML_DECLARATION);
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        let name = self.name.qualified();
        out.push('<');
        out.push_str(&name);
        for decl in &self.namespaces {
            match &decl.prefix {
                Some(prefix) => out.push_str(&format!(" xmlns:{prefix}=\"")),
                None => out.push_str(" xmlns=\""),
            }
            out.push_str(&escape(decl.uri.as_str()));
            out.push('"');
        }
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(&attr.name.qualified());
            out.push_str("=\"");
            out.push_str(&escape(attr.value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                XmlNode::Element(element) => element.write_xml(out),
                XmlNode::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&name);
        out.push('>');
    }
}

/// Parses an inbound document. Malformed input is an error rather than being
/// recovered, the network is never consulted, and any document type
/// declaration is refused so no entity is ever defined.
pub fn parse_document(input: &[u8]) -> SamlResult<Document> {
    let options = ParserOptions {
        recover: false,
        no_net: true,
        no_def_dtd: true,
        ..ParserOptions::default()
    };
    let document = XmlParser::default()
        .parse_string_with_options(input, options)
        .map_err(|e| SamlError::MalformedXml(format!("{e:?}")))?;

    let declares_dtd = document.as_node().get_child_nodes().iter().any(|node| {
        matches!(
            node.get_type(),
            Some(NodeType::DTDNode | NodeType::DocumentTypeNode)
        )
    });
    if declares_dtd {
        return Err(SamlError::MalformedXml(
            "document type declarations are not accepted".into(),
        ));
    }
    if document.get_root_element().is_none() {
        return Err(SamlError::MalformedXml("document has no root element".into()));
    }
    Ok(document)
}

pub fn root_element(document: &Document) -> SamlResult<Node> {
    document
        .get_root_element()
        .ok_or_else(|| SamlError::MalformedXml("document has no root element".into()))
}

/// Whether `node` is the element `{namespace}local`.
pub fn is_element(node: &Node, namespace: &str, local: &str) -> bool {
    node.get_type() == Some(NodeType::ElementNode)
        && node.get_name() == local
        && node.get_namespace().map(|ns| ns.get_href()).as_deref() == Some(namespace)
}

/// Direct child elements named `{namespace}local`.
pub fn children_named(node: &Node, namespace: &str, local: &str) -> Vec<Node> {
    node.get_child_elements()
        .into_iter()
        .filter(|child| is_element(child, namespace, local))
        .collect()
}

/// Value of the `ID` attribute that carries no namespace.
pub fn id_attribute(node: &Node) -> Option<String> {
    node.get_property_no_ns("ID")
}

/// The single element carrying `ID="id"`. Duplicate IDs are rejected
/// outright since they are the basis of signature wrapping.
pub fn find_by_id(document: &Document, id: &str) -> SamlResult<Option<Node>> {
    let mut found = Vec::new();
    collect_by_id(&root_element(document)?, id, &mut found);
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        _ => Err(SamlError::MalformedXml(format!("duplicate ID {id}"))),
    }
}

fn collect_by_id(node: &Node, id: &str, found: &mut Vec<Node>) {
    if id_attribute(node).as_deref() == Some(id) {
        found.push(node.clone());
    }
    for child in node.get_child_elements() {
        collect_by_id(&child, id, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SAML_NS;

    #[test]
    fn reads_namespaced_children() {
        let document = parse_document(
            br#"<?xml version="1.0"?>
<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a1">
  <saml:Issuer>https://idp.example</saml:Issuer>
  <Issuer>not this one</Issuer>
</saml:Assertion>"#,
        )
        .unwrap();

        let root = root_element(&document).unwrap();
        assert!(is_element(&root, SAML_NS, "Assertion"));
        assert_eq!(id_attribute(&root).as_deref(), Some("_a1"));
        let issuers = children_named(&root, SAML_NS, "Issuer");
        assert_eq!(issuers.len(), 1);
        assert_eq!(issuers[0].get_content(), "https://idp.example");
    }

    #[test]
    fn refuses_doctype() {
        let err = parse_document(br#"<!DOCTYPE x [<!ENTITY a "b">]><x>&a;</x>"#).err().unwrap();
        assert!(matches!(err, SamlError::MalformedXml(_)));
        let err = parse_document(br#"<!DOCTYPE x><x/>"#).err().unwrap();
        assert!(matches!(err, SamlError::MalformedXml(_)));
    }

    #[test]
    fn malformed_input_is_not_recovered() {
        assert!(parse_document(b"<a><b></a>").is_err());
        assert!(parse_document(b"").is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let document = parse_document(br#"<a ID="x"><b ID="x"/></a>"#).unwrap();
        assert!(find_by_id(&document, "x").is_err());
        assert!(find_by_id(&document, "y").unwrap().is_none());
    }

    #[test]
    fn namespaced_id_attributes_do_not_count() {
        let document =
            parse_document(br#"<a xmlns:e="urn:e"><b e:ID="x"/><c ID="x"/></a>"#).unwrap();
        let found = find_by_id(&document, "x").unwrap().unwrap();
        assert_eq!(found.get_name(), "c");
    }

    #[test]
    fn serialization_escapes_markup() {
        let element = Element::new("note")
            .with_attribute("title", "a \"quoted\" <value>")
            .with_text("x & y");
        let document = parse_document(element.to_document().as_bytes()).unwrap();
        let root = root_element(&document).unwrap();
        assert_eq!(root.get_property("title").as_deref(), Some("a \"quoted\" <value>"));
        assert_eq!(root.get_content(), "x & y");
    }
}
