//! WS-Management SOAP envelopes for the Windows remote shell.
//!
//! Request builders return complete envelopes; response parsers pull the
//! few values the shell protocol needs out of the server's replies.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

pub const CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
pub const MAX_ENVELOPE_SIZE: u32 = 153_600;
pub const OPERATION_TIMEOUT: &str = "PT60S";

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const RESOURCE_URI_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// WSManFault code for a Receive that saw no output within the operation timeout.
const OPERATION_TIMEOUT_FAULT: &str = "2150858793";

/// Where requests go and under which shell.
struct Header<'a> {
    url: &'a str,
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
}

fn envelope(header: Header<'_>, body: &str) -> String {
    let mut xml = String::with_capacity(2048 + body.len());
    xml.push_str(&format!(
        "<s:Envelope xmlns:s=\"{NS_SOAP}\" xmlns:a=\"{NS_ADDRESSING}\" xmlns:w=\"{NS_WSMAN}\" xmlns:rsp=\"{NS_SHELL}\">"
    ));
    xml.push_str("<s:Header>");
    xml.push_str(&format!("<a:To>{}</a:To>", escape(header.url)));
    xml.push_str(&format!(
        "<a:ReplyTo><a:Address s:mustUnderstand=\"true\">{ANONYMOUS}</a:Address></a:ReplyTo>"
    ));
    xml.push_str(&format!(
        "<w:MaxEnvelopeSize s:mustUnderstand=\"true\">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>"
    ));
    xml.push_str(&format!("<a:MessageID>uuid:{}</a:MessageID>", uuid::Uuid::new_v4()));
    xml.push_str("<w:Locale xml:lang=\"en-US\" s:mustUnderstand=\"false\"/>");
    xml.push_str(&format!("<w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>"));
    xml.push_str(&format!(
        "<w:ResourceURI s:mustUnderstand=\"true\">{RESOURCE_URI_CMD}</w:ResourceURI>"
    ));
    xml.push_str(&format!(
        "<a:Action s:mustUnderstand=\"true\">{}</a:Action>",
        header.action
    ));
    if let Some(shell_id) = header.shell_id {
        xml.push_str(&format!(
            "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
            escape(shell_id)
        ));
    }
    if !header.options.is_empty() {
        xml.push_str("<w:OptionSet>");
        for (name, value) in header.options {
            xml.push_str(&format!("<w:Option Name=\"{}\">{}</w:Option>", name, value));
        }
        xml.push_str("</w:OptionSet>");
    }
    xml.push_str("</s:Header><s:Body>");
    xml.push_str(body);
    xml.push_str("</s:Body></s:Envelope>");
    xml
}

/// Open a `cmd` shell with UTF-8 output.
pub fn create_shell(url: &str) -> String {
    envelope(
        Header {
            url,
            action: ACTION_CREATE,
            shell_id: None,
            options: &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
        },
        "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
    )
}

pub fn run_command(url: &str, shell_id: &str, command: &str) -> String {
    envelope(
        Header {
            url,
            action: ACTION_COMMAND,
            shell_id: Some(shell_id),
            options: &[
                ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
                ("WINRS_SKIP_CMD_SHELL", "FALSE"),
            ],
        },
        &format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command)
        ),
    )
}

/// Bytes of the envelope kept free for everything but the base64 payload.
const ENVELOPE_RESERVE: usize = 8192;

/// Largest stdin slice one Send may carry once base64 encoded.
pub const MAX_INPUT_CHUNK: usize = (MAX_ENVELOPE_SIZE as usize - ENVELOPE_RESERVE) / 4 * 3;

/// Split stdin into Send payloads; the flag marks the last one, which
/// carries `End="true"`. Empty input is still one (empty) closing Send.
pub fn input_chunks(data: &[u8]) -> Vec<(&[u8], bool)> {
    if data.is_empty() {
        return vec![(data, true)];
    }
    let count = data.len().div_ceil(MAX_INPUT_CHUNK);
    data.chunks(MAX_INPUT_CHUNK)
        .enumerate()
        .map(|(i, chunk)| (chunk, i + 1 == count))
        .collect()
}

/// Push `data` to the command's stdin; `end` closes the stream.
pub fn send_input(url: &str, shell_id: &str, command_id: &str, data: &[u8], end: bool) -> String {
    let end_attr = if end { " End=\"true\"" } else { "" };
    envelope(
        Header {
            url,
            action: ACTION_SEND,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            "<rsp:Send><rsp:Stream Name=\"stdin\" CommandId=\"{}\"{}>{}</rsp:Stream></rsp:Send>",
            escape(command_id),
            end_attr,
            STANDARD.encode(data)
        ),
    )
}

pub fn receive_output(url: &str, shell_id: &str, command_id: &str) -> String {
    envelope(
        Header {
            url,
            action: ACTION_RECEIVE,
            shell_id: Some(shell_id),
            options: &[("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE")],
        },
        &format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
            escape(command_id)
        ),
    )
}

pub fn terminate_command(url: &str, shell_id: &str, command_id: &str) -> String {
    envelope(
        Header {
            url,
            action: ACTION_SIGNAL,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>",
            escape(command_id)
        ),
    )
}

pub fn delete_shell(url: &str, shell_id: &str) -> String {
    envelope(
        Header {
            url,
            action: ACTION_DELETE,
            shell_id: Some(shell_id),
            options: &[],
        },
        "",
    )
}

/// A SOAP fault returned by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: Option<String>,
    pub message: String,
}

impl Fault {
    /// Receive polls that saw no output raise this; the command is still running.
    pub fn is_operation_timeout(&self) -> bool {
        self.code.as_deref() == Some(OPERATION_TIMEOUT_FAULT)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (fault code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Output of one Receive round trip.
#[derive(Debug, Default, PartialEq)]
pub struct ReceiveOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Flatten a document into its elements in document order, keyed by local
/// name, each carrying its own text content.
fn elements(xml: &str) -> Result<Vec<Element>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut elements: Vec<Element> = Vec::new();
    let mut open: Vec<usize> = Vec::new();

    loop {
        match reader
            .read_event()
            .map_err(|e| format!("malformed response: {}", e))?
        {
            Event::Start(start) => {
                elements.push(element(&start)?);
                open.push(elements.len() - 1);
            }
            Event::Empty(start) => elements.push(element(&start)?),
            Event::End(_) => {
                open.pop();
            }
            Event::Text(text) => {
                if let Some(&index) = open.last() {
                    let text = text
                        .unescape()
                        .map_err(|e| format!("malformed response: {}", e))?;
                    elements[index].text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(&index) = open.last() {
                    elements[index]
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(elements)
}

fn element(start: &BytesStart<'_>) -> Result<Element, String> {
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| format!("malformed response: {}", e))?;
        let value = attribute
            .unescape_value()
            .map_err(|e| format!("malformed response: {}", e))?;
        attributes.push((
            String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned(),
            value.into_owned(),
        ));
    }
    Ok(Element {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        attributes,
        text: String::new(),
    })
}

/// Extract the fault from an error response, if it is one.
pub fn parse_fault(xml: &str) -> Option<Fault> {
    let elements = elements(xml).ok()?;
    elements.iter().find(|e| e.name == "Fault")?;

    let code = elements
        .iter()
        .find(|e| e.name == "WSManFault")
        .and_then(|e| e.attribute("Code"))
        .map(str::to_string);
    let message = elements
        .iter()
        .find(|e| e.name == "Message" && !e.text.is_empty())
        .or_else(|| elements.iter().find(|e| e.name == "Text" && !e.text.is_empty()))
        .map(|e| e.text.trim().to_string())
        .unwrap_or_else(|| "unknown WS-Management fault".to_string());

    Some(Fault { code, message })
}

/// Shell id from a Create response.
pub fn parse_shell_id(xml: &str) -> Result<String, String> {
    let elements = elements(xml)?;
    elements
        .iter()
        .find(|e| e.name == "ShellId")
        .or_else(|| {
            elements
                .iter()
                .find(|e| e.name == "Selector" && e.attribute("Name") == Some("ShellId"))
        })
        .map(|e| e.text.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "response carries no shell id".to_string())
}

/// Command id from a Command response.
pub fn parse_command_id(xml: &str) -> Result<String, String> {
    elements(xml)?
        .into_iter()
        .find(|e| e.name == "CommandId")
        .map(|e| e.text)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "response carries no command id".to_string())
}

/// Streams and command state from a Receive response.
pub fn parse_receive(xml: &str) -> Result<ReceiveOutput, String> {
    let mut output = ReceiveOutput::default();

    for element in elements(xml)? {
        match element.name.as_str() {
            "Stream" => {
                if element.text.is_empty() {
                    continue;
                }
                let bytes = STANDARD
                    .decode(element.text.trim())
                    .map_err(|e| format!("invalid stream data: {}", e))?;
                match element.attribute("Name") {
                    Some("stdout") => output.stdout.extend_from_slice(&bytes),
                    Some("stderr") => output.stderr.extend_from_slice(&bytes),
                    _ => {}
                }
            }
            "CommandState" => {
                if element.attribute("State") == Some(COMMAND_STATE_DONE) {
                    output.done = true;
                }
            }
            "ExitCode" => {
                let code = element
                    .text
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| format!("invalid exit code '{}': {}", element.text, e))?;
                // Windows exit codes are DWORDs; keep the bit pattern
                output.exit_code = Some(code as i32);
            }
            _ => {}
        }
    }

    Ok(output)
}
