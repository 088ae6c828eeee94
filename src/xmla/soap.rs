//! SOAP framing for the XMLA `Execute` method.
//!
//! Requests are built as plain strings; responses are streamed through
//! quick-xml. A response carries an inline XSD describing the row type, then
//! one `<row>` element per record. Cells absent from a row are null.

use crate::constants::XMLA_NAMESPACE;
use crate::error::ServerError;
use crate::xmla::types::{CellValue, Rowset, RowsetColumn};
use chrono::{DateTime, NaiveDateTime};
use quick_xml::events::{BytesStart, Event};
use quick_xml::escape::escape;
use quick_xml::Reader;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Build an `Execute` envelope for a statement against a catalog.
pub fn build_execute_envelope(statement: &str, catalog: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            "<soap:Body>",
            r#"<Execute xmlns="{ns}">"#,
            "<Command><Statement>{statement}</Statement></Command>",
            "<Properties><PropertyList>",
            "<Catalog>{catalog}</Catalog>",
            "<Format>Tabular</Format>",
            "<Content>SchemaData</Content>",
            "</PropertyList></Properties>",
            "</Execute>",
            "</soap:Body>",
            "</soap:Envelope>"
        ),
        ns = XMLA_NAMESPACE,
        statement = escape(statement),
        catalog = escape(catalog),
    )
}

/// Decode `_xHHHH_` escapes XMLA uses to make column names valid XML names.
pub fn decode_xml_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(name.len());
    let mut i = 0;

    while i < name.len() {
        if bytes[i] == b'_' && i + 7 <= name.len() && bytes[i + 1] == b'x' && bytes[i + 6] == b'_' {
            let decoded = name
                .get(i + 2..i + 6)
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .and_then(char::from_u32);
            if let Some(c) = decoded {
                out.push(c);
                i += 7;
                continue;
            }
        }
        // Advance by one full character.
        let ch_len = name[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&name[i..i + ch_len]);
        i += ch_len;
    }

    out
}

/// Convert the text of one cell according to its XSD type.
pub fn convert_cell(text: &str, xsd_type: Option<&str>) -> CellValue {
    let Some(ty) = xsd_type else {
        return CellValue::Text(text.to_string());
    };
    let trimmed = text.trim();

    match ty {
        "string" | "anyType" => CellValue::Text(text.to_string()),
        _ if trimmed.is_empty() => CellValue::Null,
        "boolean" => match trimmed {
            "true" | "1" => CellValue::Boolean(true),
            "false" | "0" => CellValue::Boolean(false),
            _ => CellValue::Text(text.to_string()),
        },
        "long" | "int" | "short" | "byte" | "integer" | "unsignedLong" | "unsignedInt"
        | "unsignedShort" | "unsignedByte" => trimmed
            .parse::<i64>()
            .map(CellValue::Integer)
            .or_else(|_| Decimal::from_str(trimmed).map(CellValue::Decimal))
            .unwrap_or_else(|_| CellValue::Text(text.to_string())),
        "double" | "float" => trimmed
            .parse::<f64>()
            .map(CellValue::Double)
            .unwrap_or_else(|_| CellValue::Text(text.to_string())),
        "decimal" => Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map(CellValue::Decimal)
            .unwrap_or_else(|_| CellValue::Text(text.to_string())),
        "dateTime" => parse_datetime(trimmed).unwrap_or_else(|| CellValue::Text(text.to_string())),
        _ => CellValue::Text(text.to_string()),
    }
}

fn parse_datetime(text: &str) -> Option<CellValue> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(CellValue::DateTimeOffset(dt));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(CellValue::DateTime)
}

/// An error element reported by the server.
#[derive(Debug, Default)]
struct ServerFault {
    description: Option<String>,
    code: Option<String>,
}

impl ServerFault {
    fn into_error(self) -> ServerError {
        let message = self
            .description
            .unwrap_or_else(|| "The server rejected the request".to_string());
        match self.code {
            Some(code) => ServerError::query_error_with_code(message, code),
            None => ServerError::query_error(message),
        }
    }
}

/// Column as declared in the row schema.
struct SchemaColumn {
    element: String,
    column: RowsetColumn,
}

#[derive(Default)]
struct RowsetBuilder {
    columns: Vec<SchemaColumn>,
    rows: Vec<Vec<CellValue>>,
    row: Option<Vec<CellValue>>,
    cell: Option<(usize, bool)>,
    text: String,
    in_row_type: bool,
    in_fault_string: bool,
    fault: Option<ServerFault>,
}

impl RowsetBuilder {
    fn column_for(&mut self, element: &str) -> usize {
        if let Some(idx) = self.columns.iter().position(|c| c.element == element) {
            return idx;
        }
        // Schema-less response: learn columns as they appear.
        self.columns.push(SchemaColumn {
            element: element.to_string(),
            column: RowsetColumn::new(decode_xml_name(element)),
        });
        for row in &mut self.rows {
            row.push(CellValue::Null);
        }
        if let Some(row) = self.row.as_mut() {
            row.push(CellValue::Null);
        }
        self.columns.len() - 1
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<(), ServerError> {
        let name = local_name(e);

        if self.row.is_some() {
            let idx = self.column_for(&name);
            let nil = attribute(e, "nil")?.is_some_and(|v| v == "true");
            if empty {
                self.finish_cell(idx, nil, "");
            } else {
                self.cell = Some((idx, nil));
                self.text.clear();
            }
            return Ok(());
        }

        match name.as_str() {
            "complexType" => {
                if attribute(e, "name")?.as_deref() == Some("row") {
                    self.in_row_type = !empty;
                }
            }
            "element" if self.in_row_type => {
                if let Some(element) = attribute(e, "name")? {
                    let display = attribute(e, "field")?.unwrap_or_else(|| decode_xml_name(&element));
                    let data_type = attribute(e, "type")?
                        .map(|t| t.rsplit(':').next().unwrap_or_default().to_string());
                    self.columns.push(SchemaColumn {
                        element,
                        column: RowsetColumn {
                            name: display,
                            data_type,
                        },
                    });
                }
            }
            "row" if !empty => {
                self.row = Some(vec![CellValue::Null; self.columns.len()]);
            }
            "row" => self.rows.push(vec![CellValue::Null; self.columns.len()]),
            "Fault" => {
                self.fault.get_or_insert_with(ServerFault::default);
            }
            "faultstring" if !empty => {
                self.in_fault_string = true;
                self.text.clear();
            }
            "Error" => {
                let fault = self.fault.get_or_insert_with(ServerFault::default);
                if fault.code.is_none() {
                    fault.code = attribute(e, "ErrorCode")?;
                }
                if let Some(description) = attribute(e, "Description")? {
                    fault.description = Some(description);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &str) {
        if let Some((idx, nil)) = self.cell.take() {
            let text = std::mem::take(&mut self.text);
            self.finish_cell(idx, nil, &text);
            return;
        }

        match name {
            "row" => {
                if let Some(row) = self.row.take() {
                    self.rows.push(row);
                }
            }
            "complexType" => self.in_row_type = false,
            "faultstring" if self.in_fault_string => {
                self.in_fault_string = false;
                let text = std::mem::take(&mut self.text);
                let fault = self.fault.get_or_insert_with(ServerFault::default);
                if fault.description.is_none() && !text.trim().is_empty() {
                    fault.description = Some(text.trim().to_string());
                }
            }
            _ => {}
        }
    }

    fn finish_cell(&mut self, idx: usize, nil: bool, text: &str) {
        let value = if nil {
            CellValue::Null
        } else {
            let ty = self.columns.get(idx).and_then(|c| c.column.data_type.as_deref());
            convert_cell(text, ty)
        };
        if let Some(slot) = self.row.as_mut().and_then(|r| r.get_mut(idx)) {
            *slot = value;
        }
    }

    fn capturing_text(&self) -> bool {
        self.cell.is_some() || self.in_fault_string
    }

    fn finish(self) -> Result<Rowset, ServerError> {
        if let Some(fault) = self.fault {
            return Err(fault.into_error());
        }
        Ok(Rowset::new(
            self.columns.into_iter().map(|c| c.column).collect(),
            self.rows,
        ))
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Value of the attribute whose local name is `name`.
fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, ServerError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ServerError::internal(format!("Malformed XMLA attribute: {}", err)))?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| ServerError::internal(format!("Malformed XMLA attribute: {}", err)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parse an `ExecuteResponse` body into a rowset.
///
/// A SOAP fault or XMLA error element becomes a `QuerySyntax` error carrying
/// the server's description.
pub fn parse_execute_response(body: &str) -> Result<Rowset, ServerError> {
    let mut reader = Reader::from_str(body);
    let mut builder = RowsetBuilder::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => builder.start(&e, false)?,
            Event::Empty(e) => builder.start(&e, true)?,
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                builder.end(&name);
            }
            Event::Text(t) if builder.capturing_text() => {
                let text = t
                    .unescape()
                    .map_err(|err| ServerError::internal(format!("Malformed XMLA text: {}", err)))?;
                builder.text.push_str(&text);
            }
            Event::CData(c) if builder.capturing_text() => {
                builder.text.push_str(&String::from_utf8_lossy(&c));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    builder.finish()
}

/// Whether a body looks like a SOAP envelope at all.
pub fn is_soap_envelope(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with("<?xml") || head.starts_with('<') && head.contains("Envelope")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ROWSET: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <ExecuteResponse xmlns="urn:schemas-microsoft-com:xml-analysis">
      <return>
        <root xmlns="urn:schemas-microsoft-com:xml-analysis:rowset" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:sql="urn:schemas-microsoft-com:xml-sql">
          <xsd:schema targetNamespace="urn:schemas-microsoft-com:xml-analysis:rowset">
            <xsd:complexType name="root">
              <xsd:sequence><xsd:element name="row" type="row" minOccurs="0" maxOccurs="unbounded"/></xsd:sequence>
            </xsd:complexType>
            <xsd:complexType name="row">
              <xsd:sequence>
                <xsd:element sql:field="Sales[Date]" name="Sales_x005B_Date_x005D_" type="xsd:dateTime" minOccurs="0"/>
                <xsd:element sql:field="Sales[Amount]" name="Sales_x005B_Amount_x005D_" type="xsd:decimal" minOccurs="0"/>
                <xsd:element sql:field="Sales[Region]" name="Sales_x005B_Region_x005D_" type="xsd:string" minOccurs="0"/>
                <xsd:element sql:field="[Units]" name="_x005B_Units_x005D_" type="xsd:long" minOccurs="0"/>
              </xsd:sequence>
            </xsd:complexType>
          </xsd:schema>
          <row>
            <Sales_x005B_Date_x005D_>2024-01-15T00:00:00</Sales_x005B_Date_x005D_>
            <Sales_x005B_Amount_x005D_>1234.5600</Sales_x005B_Amount_x005D_>
            <Sales_x005B_Region_x005D_>North &amp; East</Sales_x005B_Region_x005D_>
            <_x005B_Units_x005D_>12</_x005B_Units_x005D_>
          </row>
          <row>
            <Sales_x005B_Date_x005D_>2024-01-16T00:00:00</Sales_x005B_Date_x005D_>
            <Sales_x005B_Region_x005D_ xsi:nil="true"/>
          </row>
        </root>
      </return>
    </ExecuteResponse>
  </soap:Body>
</soap:Envelope>"#;

    const FAULT: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault xmlns="http://schemas.xmlsoap.org/soap/envelope/">
      <faultcode>XMLAnalysisError.0xc10a0004</faultcode>
      <faultstring>Query (1, 10) The syntax for 'Salez' is incorrect.</faultstring>
      <detail>
        <Error ErrorCode="3238002695" Description="Query (1, 10) The syntax for 'Salez' is incorrect." Source="Microsoft SQL Server Analysis Services" HelpFile=""/>
      </detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_rowset() {
        let rowset = parse_execute_response(ROWSET).unwrap();
        let names: Vec<_> = rowset.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Sales[Date]", "Sales[Amount]", "Sales[Region]", "[Units]"]
        );
        assert_eq!(rowset.len(), 2);

        assert!(matches!(rowset.rows[0][0], CellValue::DateTime(_)));
        assert_eq!(
            rowset.rows[0][1],
            CellValue::Decimal(Decimal::from_str("1234.5600").unwrap())
        );
        assert_eq!(rowset.rows[0][2], CellValue::Text("North & East".into()));
        assert_eq!(rowset.rows[0][3], CellValue::Integer(12));

        // Absent and nil cells are null.
        assert_eq!(rowset.rows[1][1], CellValue::Null);
        assert_eq!(rowset.rows[1][2], CellValue::Null);
        assert_eq!(rowset.rows[1][3], CellValue::Null);
    }

    #[test]
    fn test_parse_fault() {
        let err = parse_execute_response(FAULT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuerySyntaxError);
        assert!(err.to_string().contains("Salez"));
        match err {
            ServerError::QuerySyntax { code, .. } => assert_eq!(code.as_deref(), Some("3238002695")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty_rowset() {
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ExecuteResponse xmlns="urn:schemas-microsoft-com:xml-analysis"><return><root xmlns="urn:schemas-microsoft-com:xml-analysis:empty"/></return></ExecuteResponse></soap:Body></soap:Envelope>"#;
        let rowset = parse_execute_response(body).unwrap();
        assert!(rowset.is_empty());
        assert!(rowset.columns.is_empty());
    }

    #[test]
    fn test_parse_schemaless_rows() {
        let body = r#"<root><row><ID>7</ID><Name>Sales</Name></row><row><Name>Product</Name></row></root>"#;
        let rowset = parse_execute_response(body).unwrap();
        assert_eq!(rowset.columns.len(), 2);
        assert_eq!(rowset.cell(0, "ID"), Some(&CellValue::Text("7".into())));
        assert_eq!(rowset.cell(1, "ID"), Some(&CellValue::Null));
        assert_eq!(rowset.cell(1, "Name"), Some(&CellValue::Text("Product".into())));
    }

    #[test]
    fn test_envelope_escapes_statement() {
        let envelope = build_execute_envelope(
            "EVALUATE FILTER(Sales, Sales[Amount] > 5 && Sales[Region] = \"N\")",
            "Contoso & Co",
        );
        assert!(envelope.contains("Sales[Amount] &gt; 5 &amp;&amp;"));
        assert!(envelope.contains("<Catalog>Contoso &amp; Co</Catalog>"));
        assert!(envelope.contains("<Format>Tabular</Format>"));

        // The envelope itself parses as XML.
        let mut reader = Reader::from_str(&envelope);
        while !matches!(reader.read_event().unwrap(), Event::Eof) {}
    }

    #[test]
    fn test_decode_xml_name() {
        assert_eq!(decode_xml_name("Sales_x005B_Amount_x005D_"), "Sales[Amount]");
        assert_eq!(decode_xml_name("Order_x0020_Date"), "Order Date");
        assert_eq!(decode_xml_name("plain_name"), "plain_name");
        assert_eq!(decode_xml_name("_xZZZZ_"), "_xZZZZ_");
        assert_eq!(decode_xml_name("Caf\u{e9}_x0020_"), "Caf\u{e9} ");
    }

    #[test]
    fn test_convert_cell_types() {
        assert_eq!(convert_cell("true", Some("boolean")), CellValue::Boolean(true));
        assert_eq!(convert_cell("", Some("long")), CellValue::Null);
        assert_eq!(convert_cell("", Some("string")), CellValue::Text(String::new()));
        assert_eq!(convert_cell("2.5", Some("double")), CellValue::Double(2.5));
        assert!(matches!(
            convert_cell("2024-01-15T10:00:00+02:00", Some("dateTime")),
            CellValue::DateTimeOffset(_)
        ));
        assert_eq!(
            convert_cell("1E-05", Some("decimal")),
            CellValue::Decimal(Decimal::from_str("0.00001").unwrap())
        );
        assert_eq!(convert_cell("abc", None), CellValue::Text("abc".into()));
    }

    #[test]
    fn test_is_soap_envelope() {
        assert!(is_soap_envelope(FAULT));
        assert!(!is_soap_envelope("Service Unavailable"));
        assert!(!is_soap_envelope("<html><body>502</body></html>"));
    }
}
