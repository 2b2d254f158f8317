pub mod formatter;
pub mod prefix;
