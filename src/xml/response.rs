use serde::Serialize;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Serialize a response body to XML, prefixed with the declaration S3
/// clients expect.
pub fn to_xml<T: Serialize>(value: &T) -> Result<String, quick_xml::SeError> {
    let mut xml = String::from(XML_DECLARATION);
    xml.push_str(&quick_xml::se::to_string(value)?);
    Ok(xml)
}
