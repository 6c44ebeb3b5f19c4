//! Canonical XML of a libxml subtree.
//!
//! Both the exclusive and the inclusive 1.0 algorithms are delegated to
//! libxml2, so signer and verifier canonicalize the tree the same parser
//! produced, with attribute-value and line-end normalization already applied.

use libxml::tree::{
    c14n::{CanonicalizationMode, CanonicalizationOptions},
    Node,
};

use crate::{SamlError, SamlResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalizationMethod {
    #[default]
    ExclusiveC14n,
    ExclusiveC14nWithComments,
    InclusiveC14n,
    InclusiveC14nWithComments,
}

impl CanonicalizationMethod {
    const ALL: [CanonicalizationMethod; 4] = [
        CanonicalizationMethod::ExclusiveC14n,
        CanonicalizationMethod::ExclusiveC14nWithComments,
        CanonicalizationMethod::InclusiveC14n,
        CanonicalizationMethod::InclusiveC14nWithComments,
    ];

    pub fn uri(&self) -> &'static str {
        match self {
            CanonicalizationMethod::ExclusiveC14n => "http://www.w3.org/2001/10/xml-exc-c14n#",
            CanonicalizationMethod::ExclusiveC14nWithComments => {
                "http://www.w3.org/2001/10/xml-exc-c14n#WithComments"
            }
            CanonicalizationMethod::InclusiveC14n => {
                "http://www.w3.org/TR/2001/REC-xml-c14n-20010315"
            }
            CanonicalizationMethod::InclusiveC14nWithComments => {
                "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments"
            }
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.uri() == uri)
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            CanonicalizationMethod::ExclusiveC14n
                | CanonicalizationMethod::ExclusiveC14nWithComments
        )
    }

    fn with_comments(&self) -> bool {
        matches!(
            self,
            CanonicalizationMethod::ExclusiveC14nWithComments
                | CanonicalizationMethod::InclusiveC14nWithComments
        )
    }

    fn options(&self, inclusive_prefixes: &[String]) -> CanonicalizationOptions {
        let (mode, inclusive_ns_prefixes) = if self.is_exclusive() {
            (
                CanonicalizationMode::ExclusiveCanonical1_0,
                inclusive_prefixes.to_vec(),
            )
        } else {
            (CanonicalizationMode::Canonical1_0, Vec::new())
        };
        CanonicalizationOptions {
            mode,
            with_comments: self.with_comments(),
            inclusive_ns_prefixes,
        }
    }
}

/// Canonical bytes of the subtree rooted at `node`. `inclusive_prefixes` is
/// the InclusiveNamespaces PrefixList and only applies to the exclusive forms.
pub fn canonicalize(
    node: &Node,
    method: CanonicalizationMethod,
    inclusive_prefixes: &[String],
) -> SamlResult<Vec<u8>> {
    let mut node = node.clone();
    node.canonicalize(method.options(inclusive_prefixes))
        .map(String::into_bytes)
        .map_err(|()| SamlError::MalformedXml(format!("{} failed", method.uri())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    fn first_child(xml: &str) -> (libxml::tree::Document, Node) {
        let document = parse_document(xml.as_bytes()).unwrap();
        let child = document
            .get_root_element()
            .unwrap()
            .get_first_element_child()
            .unwrap();
        (document, child)
    }

    fn canonical(node: &Node, method: CanonicalizationMethod) -> String {
        String::from_utf8(canonicalize(node, method, &[]).unwrap()).unwrap()
    }

    #[test]
    fn exclusive_form_keeps_only_utilized_namespaces() {
        let (_document, child) =
            first_child(r#"<p:a xmlns:p="urn:p" xmlns:q="urn:q"><p:b z="2" a="1"/></p:a>"#);
        assert_eq!(
            canonical(&child, CanonicalizationMethod::ExclusiveC14n),
            r#"<p:b xmlns:p="urn:p" a="1" z="2"></p:b>"#
        );
    }

    #[test]
    fn inclusive_form_renders_ancestor_namespaces() {
        let (_document, child) =
            first_child(r#"<p:a xmlns:p="urn:p" xmlns:q="urn:q"><p:b/></p:a>"#);
        assert_eq!(
            canonical(&child, CanonicalizationMethod::InclusiveC14n),
            r#"<p:b xmlns:p="urn:p" xmlns:q="urn:q"></p:b>"#
        );
    }

    #[test]
    fn prefix_list_forces_unused_namespaces() {
        let (_document, child) =
            first_child(r#"<p:a xmlns:p="urn:p" xmlns:q="urn:q"><p:b/></p:a>"#);
        let bytes = canonicalize(
            &child,
            CanonicalizationMethod::ExclusiveC14n,
            &["q".to_string()],
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"<p:b xmlns:p="urn:p" xmlns:q="urn:q"></p:b>"#
        );
    }

    #[test]
    fn attribute_whitespace_is_normalized_before_canonicalization() {
        let (_literal, literal) = first_child("<r><a x=\"1\n2\"/></r>");
        let (_escaped, escaped) = first_child("<r><a x=\"1&#10;2\"/></r>");
        assert_eq!(
            canonical(&literal, CanonicalizationMethod::ExclusiveC14n),
            r#"<a x="1 2"></a>"#
        );
        assert_eq!(
            canonical(&escaped, CanonicalizationMethod::ExclusiveC14n),
            r#"<a x="1&#xA;2"></a>"#
        );
    }

    #[test]
    fn line_ends_are_normalized() {
        let (_document, child) = first_child("<r><t>one\r\ntwo</t></r>");
        assert_eq!(
            canonical(&child, CanonicalizationMethod::ExclusiveC14n),
            "<t>one\ntwo</t>"
        );
    }

    #[test]
    fn comments_follow_the_method() {
        let (_document, child) = first_child("<r><t>a<!--note-->b</t></r>");
        assert_eq!(
            canonical(&child, CanonicalizationMethod::ExclusiveC14n),
            "<t>ab</t>"
        );
        assert_eq!(
            canonical(&child, CanonicalizationMethod::ExclusiveC14nWithComments),
            "<t>a<!--note-->b</t>"
        );
    }

    #[test]
    fn method_uris_round_trip() {
        for method in CanonicalizationMethod::ALL {
            assert_eq!(CanonicalizationMethod::from_uri(method.uri()), Some(method));
        }
        assert_eq!(CanonicalizationMethod::from_uri("urn:example"), None);
    }
}
