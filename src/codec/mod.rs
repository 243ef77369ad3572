pub mod customization_xml;

pub use customization_xml::*;
