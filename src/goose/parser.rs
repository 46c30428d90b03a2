//! Ethernet frame and GOOSE APDU decoding.

use snafu::{ResultExt as _, ensure};
use tracing::{debug, instrument};

use super::{Ber, FrameTooShort, GooseError, InvalidApdu, LengthMismatch, NotGoose};
use crate::mms::{
    ber::{BerReader, Tlv},
    value::{MmsValue, tag},
};

/// EtherType of GOOSE frames.
pub const ETHER_TYPE_GOOSE: u16 = 0x88b8;
/// Smallest frame holding the Ethernet and GOOSE headers.
pub const MIN_FRAME_SIZE: usize = 22;
/// Ethernet header without a VLAN tag.
const ETHERNET_HEADER_SIZE: usize = 14;
/// Size of an 802.1Q tag.
const VLAN_TAG_SIZE: usize = 4;
/// Tag of the GOOSE APDU.
const GOOSE_PDU_TAG: u8 = 0x61;

/// Context tags of the GOOSE APDU fields.
mod field {
    /// Control block reference.
    pub const GOCB_REF: u8 = 0x80;
    /// Time allowed to live in milliseconds.
    pub const TIME_ALLOWED_TO_LIVE: u8 = 0x81;
    /// Data set reference.
    pub const DAT_SET: u8 = 0x82;
    /// GOOSE identifier.
    pub const GO_ID: u8 = 0x83;
    /// Time of the last state change.
    pub const TIMESTAMP: u8 = 0x84;
    /// State number.
    pub const ST_NUM: u8 = 0x85;
    /// Sequence number.
    pub const SQ_NUM: u8 = 0x86;
    /// Simulation or test flag.
    pub const SIMULATION: u8 = 0x87;
    /// Configuration revision.
    pub const CONF_REV: u8 = 0x88;
    /// Needs commissioning flag.
    pub const NDS_COM: u8 = 0x89;
    /// Number of data set entries.
    pub const NUM_DAT_SET_ENTRIES: u8 = 0x8a;
    /// Data set values.
    pub const ALL_DATA: u8 = 0xab;
}

/// The APDU of a GOOSE frame and the application id it was sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GooseFrame<'a> {
    /// Application id of the header.
    pub app_id: u16,
    /// The bytes following the reserved fields.
    pub apdu: &'a [u8],
}

/// A decoded GOOSE message for the subscribed data set.
#[derive(Debug, Clone, PartialEq)]
pub struct GooseMessage {
    /// Application id of the header.
    pub app_id: u16,
    /// Control block reference.
    pub gocb_ref: String,
    /// Time allowed to live in milliseconds.
    pub time_allowed_to_live: u32,
    /// Data set reference.
    pub dat_set: String,
    /// GOOSE identifier.
    pub go_id: String,
    /// Time of the last state change as a UTC time.
    pub timestamp: MmsValue,
    /// State number.
    pub st_num: u32,
    /// Sequence number.
    pub sq_num: u32,
    /// Simulation or test flag.
    pub simulation: bool,
    /// Configuration revision.
    pub conf_rev: u32,
    /// Needs commissioning flag.
    pub nds_com: bool,
    /// Number of data set entries announced by the publisher.
    pub number_of_dat_set_entries: u32,
    /// The data set values.
    pub data_set_values: Vec<MmsValue>,
}

/// Read a big endian u16 at `pos`. The caller checked the bounds.
const fn read_u16(frame: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([frame[pos], frame[pos + 1]])
}

/// Strip the Ethernet and GOOSE headers of a frame.
#[instrument(level = "trace", skip(frame))]
pub fn parse_frame(frame: &[u8]) -> Result<GooseFrame<'_>, GooseError> {
    ensure!(frame.len() >= MIN_FRAME_SIZE, FrameTooShort { length: frame.len() });

    // Destination and source MAC.
    let mut pos = 12;
    let mut header_size = ETHERNET_HEADER_SIZE;
    if frame[pos] == 0x81 && frame[pos + 1] == 0x00 {
        pos += VLAN_TAG_SIZE;
        header_size += VLAN_TAG_SIZE;
    }
    // EtherType, appId, length and the reserved words.
    ensure!(frame.len() >= pos + 10, FrameTooShort { length: frame.len() });

    let ether_type = read_u16(frame, pos);
    ensure!(ether_type == ETHER_TYPE_GOOSE, NotGoose { ether_type });
    let app_id = read_u16(frame, pos + 2);
    let length = usize::from(read_u16(frame, pos + 4));
    ensure!(
        frame.len() == length + header_size,
        LengthMismatch { length: frame.len(), declared: length }
    );

    Ok(GooseFrame { app_id, apdu: &frame[pos + 10..] })
}

/// Decode a GOOSE APDU.
///
/// Returns `Ok(None)` if the message belongs to another data set. The values are written
/// into a copy of `current_values`, which fixes the count and types of the elements.
#[instrument(level = "trace", skip(apdu, current_values))]
pub fn parse_apdu(
    app_id: u16,
    apdu: &[u8],
    data_set_ref: &str,
    current_values: &[MmsValue],
) -> Result<Option<GooseMessage>, GooseError> {
    let pdu = BerReader::new(apdu).expect(GOOSE_PDU_TAG).context(Ber)?;

    let mut message = GooseMessage {
        app_id,
        gocb_ref: String::new(),
        time_allowed_to_live: 0,
        dat_set: String::new(),
        go_id: String::new(),
        timestamp: MmsValue::new_utc_time(0),
        st_num: 0,
        sq_num: 0,
        simulation: false,
        conf_rev: 0,
        nds_com: false,
        number_of_dat_set_entries: 0,
        data_set_values: Vec::new(),
    };
    let mut dat_set_matched = false;
    let mut all_data = None;

    for tlv in pdu.children() {
        let tlv = tlv.context(Ber)?;
        match tlv.tag {
            field::GOCB_REF => message.gocb_ref = visible_string(&tlv),
            field::TIME_ALLOWED_TO_LIVE => {
                message.time_allowed_to_live = tlv.as_u32().context(Ber)?;
            }
            field::DAT_SET => {
                if tlv.value != data_set_ref.as_bytes() {
                    debug!("Data set {:?} is not subscribed", String::from_utf8_lossy(tlv.value));
                    return Ok(None);
                }
                dat_set_matched = true;
                message.dat_set = data_set_ref.to_owned();
            }
            field::GO_ID => message.go_id = visible_string(&tlv),
            field::TIMESTAMP => {
                let Ok(time) = <&[u8; 8]>::try_from(tlv.value) else {
                    return InvalidApdu { reason: "timestamp is not 8 bytes" }.fail();
                };
                message.timestamp.set_utc_time_by_buffer(time);
            }
            field::ST_NUM => message.st_num = tlv.as_u32().context(Ber)?,
            field::SQ_NUM => message.sq_num = tlv.as_u32().context(Ber)?,
            field::SIMULATION => message.simulation = tlv.as_bool().context(Ber)?,
            field::CONF_REV => message.conf_rev = tlv.as_u32().context(Ber)?,
            field::NDS_COM => message.nds_com = tlv.as_bool().context(Ber)?,
            field::NUM_DAT_SET_ENTRIES => {
                message.number_of_dat_set_entries = tlv.as_u32().context(Ber)?;
            }
            field::ALL_DATA => all_data = Some(tlv),
            other => debug!("Ignoring unknown GOOSE field {other:#04x}"),
        }
    }

    if !dat_set_matched {
        debug!("GOOSE message without data set reference");
        return Ok(None);
    }

    let mut values = current_values.to_vec();
    if let Some(all_data) = all_data {
        apply_all_data(all_data.value, &mut values)?;
    }
    message.data_set_values = values;
    Ok(Some(message))
}

/// The content of a visible string field, lossy on invalid bytes.
fn visible_string(tlv: &Tlv<'_>) -> String {
    String::from_utf8_lossy(tlv.value).into_owned()
}

/// Write the elements of an allData sequence into `values`.
///
/// Elements whose type does not match the value they land on are skipped, and so are
/// elements past the end of `values`.
fn apply_all_data(content: &[u8], values: &mut [MmsValue]) -> Result<(), GooseError> {
    let capacity = values.len();
    let mut targets = values.iter_mut();
    for (index, tlv) in BerReader::new(content).enumerate() {
        let tlv = tlv.context(Ber)?;
        let Some(target) = targets.next() else {
            debug!("Skipping elements from {index} on: the template holds {capacity}");
            return Ok(());
        };
        match (tlv.tag, target) {
            (tag::ARRAY, MmsValue::Array(children))
            | (tag::STRUCTURE, MmsValue::Structure(children)) => {
                apply_all_data(tlv.value, children)?;
            }
            (tag::ARRAY | tag::STRUCTURE, target) => {
                debug!(
                    "Skipping element {index}: tag {:#04x} does not match {:?}",
                    tlv.tag,
                    target.get_type()
                );
            }
            (_, target) => match MmsValue::from_tlv(&tlv) {
                Ok(decoded) => {
                    if !assign(target, &decoded) {
                        debug!(
                            "Skipping element {index}: {:?} does not fit {:?}",
                            decoded.get_type(),
                            target.get_type()
                        );
                    }
                }
                Err(error) => debug!("Skipping element {index}: {error}"),
            },
        }
    }
    Ok(())
}

/// Copy a decoded primitive into the template value.
///
/// Octet strings only have to fit the capacity of the target.
fn assign(target: &mut MmsValue, decoded: &MmsValue) -> bool {
    match decoded {
        MmsValue::OctetString(octets) if matches!(target, MmsValue::OctetString(_)) => {
            target.set_octet_string(&octets.buf)
        }
        _ => target.update(decoded),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mms::ber::BerWriter;

    /// Build a GOOSE frame for `dat_set` carrying the encoded `all_data` elements.
    pub(crate) fn goose_frame(
        dat_set: &str,
        st_num: u32,
        sq_num: u32,
        vlan: bool,
        all_data: impl FnOnce(&mut BerWriter),
    ) -> Vec<u8> {
        let mut pdu = BerWriter::new();
        pdu.constructed(GOOSE_PDU_TAG, |w| {
            w.string(field::GOCB_REF, "ied1Inverter/LLN0$GO$gcb01")
                .uint(field::TIME_ALLOWED_TO_LIVE, 2000)
                .string(field::DAT_SET, dat_set)
                .string(field::GO_ID, "events")
                .primitive(field::TIMESTAMP, &[0x5f, 0x5e, 0x10, 0x00, 0x80, 0x00, 0x00, 0x0a])
                .uint(field::ST_NUM, st_num)
                .uint(field::SQ_NUM, sq_num)
                .boolean(field::SIMULATION, false)
                .uint(field::CONF_REV, 3)
                .boolean(field::NDS_COM, false)
                .uint(field::NUM_DAT_SET_ENTRIES, 3)
                .constructed(field::ALL_DATA, all_data);
        });
        let apdu = pdu.into_vec();

        let mut frame = vec![
            0x01, 0x0c, 0xcd, 0x01, 0x00, 0x01, 0x00, 0x1a, 0xb6, 0x03, 0x2f, 0x1c,
        ];
        if vlan {
            frame.extend_from_slice(&[0x81, 0x00, 0x80, 0x00]);
        }
        frame.extend_from_slice(&ETHER_TYPE_GOOSE.to_be_bytes());
        frame.extend_from_slice(&0x1000_u16.to_be_bytes());
        frame.extend_from_slice(&u16::try_from(apdu.len() + 8).unwrap().to_be_bytes());
        frame.extend_from_slice(&[0; 4]);
        frame.extend_from_slice(&apdu);
        frame
    }

    /// Boolean, 32 bit integer and an octet string of up to 8 bytes.
    pub(crate) fn template() -> Vec<MmsValue> {
        vec![MmsValue::Boolean(false), MmsValue::new_i32(0), MmsValue::new_octet_string(0, 8)]
    }

    fn standard_data(w: &mut BerWriter) {
        w.boolean(tag::BOOLEAN, true)
            .int(tag::INTEGER, 1234)
            .primitive(tag::OCTET_STRING, &[1, 2, 3]);
    }

    #[test]
    fn test_parse_frame() {
        let frame = goose_frame("ied1Inverter/LLN0$Events", 1, 0, false, standard_data);
        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.app_id, 0x1000);
        assert_eq!(parsed.apdu[0], GOOSE_PDU_TAG);
        assert_eq!(parsed.apdu.len(), frame.len() - 22);

        let tagged = goose_frame("ied1Inverter/LLN0$Events", 1, 0, true, standard_data);
        let parsed = parse_frame(&tagged).unwrap();
        assert_eq!(parsed.app_id, 0x1000);
        assert_eq!(parsed.apdu.len(), tagged.len() - 26);
    }

    #[test]
    fn test_parse_frame_errors() {
        assert!(matches!(parse_frame(&[0; 21]), Err(GooseError::FrameTooShort { length: 21, .. })));

        let mut frame = goose_frame("ds", 1, 0, false, standard_data);
        frame.push(0);
        assert!(matches!(parse_frame(&frame), Err(GooseError::LengthMismatch { .. })));

        let mut frame = goose_frame("ds", 1, 0, false, standard_data);
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(matches!(
            parse_frame(&frame),
            Err(GooseError::NotGoose { ether_type: 0x0800, .. })
        ));

        // A VLAN tag leaves no room for the rest of the header.
        let mut frame = vec![0; 22];
        frame[12] = 0x81;
        assert!(matches!(parse_frame(&frame), Err(GooseError::FrameTooShort { .. })));
    }

    #[test]
    fn test_parse_apdu() {
        let frame = goose_frame("ied1Inverter/LLN0$Events", 5, 10, false, standard_data);
        let parsed = parse_frame(&frame).unwrap();
        let message = parse_apdu(
            parsed.app_id,
            parsed.apdu,
            "ied1Inverter/LLN0$Events",
            &template(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(message.gocb_ref, "ied1Inverter/LLN0$GO$gcb01");
        assert_eq!(message.go_id, "events");
        assert_eq!(message.time_allowed_to_live, 2000);
        assert_eq!(message.st_num, 5);
        assert_eq!(message.sq_num, 10);
        assert_eq!(message.conf_rev, 3);
        assert_eq!(message.number_of_dat_set_entries, 3);
        assert!(!message.simulation);
        assert_eq!(message.timestamp.utc_time_seconds(), Some(0x5f5e_1000));
        assert_eq!(message.data_set_values[0], MmsValue::Boolean(true));
        assert_eq!(message.data_set_values[1].to_i32(), Some(1234));
        assert_eq!(message.data_set_values[2].as_octets(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn test_data_set_mismatch() {
        let frame = goose_frame("ied1Inverter/LLN0$Events", 1, 0, false, standard_data);
        let parsed = parse_frame(&frame).unwrap();
        // Prefix and different content.
        for reference in [
            "ied1Inverter/LLN0$Event",
            "ied1Inverter/LLN0$Events2",
            "ied1Inverter/LLN0$Eventz",
        ] {
            assert_eq!(parse_apdu(0, parsed.apdu, reference, &template()).unwrap(), None);
        }
    }

    #[test]
    fn test_type_mismatch_is_skipped() {
        let frame = goose_frame("ds", 1, 0, false, |w| {
            w.int(tag::INTEGER, 7)
                .constructed(tag::STRUCTURE, |s| {
                    s.boolean(tag::BOOLEAN, true);
                })
                .primitive(tag::OCTET_STRING, &[0; 9]);
        });
        let parsed = parse_frame(&frame).unwrap();
        let message = parse_apdu(0, parsed.apdu, "ds", &template()).unwrap().unwrap();
        assert_eq!(message.data_set_values, template());
    }

    #[test]
    fn test_nested_values() {
        let template = vec![MmsValue::Structure(vec![
            MmsValue::new_i32(0),
            MmsValue::Array(vec![MmsValue::Boolean(false), MmsValue::Boolean(false)]),
        ])];
        let frame = goose_frame("ds", 1, 0, false, |w| {
            w.constructed(tag::STRUCTURE, |s| {
                s.int(tag::INTEGER, -3).constructed(tag::ARRAY, |a| {
                    a.boolean(tag::BOOLEAN, false).boolean(tag::BOOLEAN, true);
                });
            });
        });
        let parsed = parse_frame(&frame).unwrap();
        let message = parse_apdu(0, parsed.apdu, "ds", &template).unwrap().unwrap();
        assert_eq!(
            message.data_set_values,
            vec![MmsValue::Structure(vec![
                MmsValue::new_i32(-3),
                MmsValue::Array(vec![MmsValue::Boolean(false), MmsValue::Boolean(true)]),
            ])]
        );
    }

    #[test]
    fn test_surplus_elements_are_skipped() {
        let frame = goose_frame("ds", 5, 10, false, |w| {
            standard_data(w);
            w.boolean(tag::BOOLEAN, true);
        });
        let parsed = parse_frame(&frame).unwrap();
        let message = parse_apdu(0, parsed.apdu, "ds", &template()).unwrap().unwrap();
        assert_eq!(message.st_num, 5);
        assert_eq!(message.sq_num, 10);
        assert_eq!(message.data_set_values.len(), 3);
        assert_eq!(message.data_set_values[0], MmsValue::Boolean(true));
        assert_eq!(message.data_set_values[1].to_i32(), Some(1234));

        // Inside a structure as well.
        let template = vec![
            MmsValue::Structure(vec![MmsValue::Boolean(false)]),
            MmsValue::new_i32(0),
        ];
        let frame = goose_frame("ds", 1, 0, false, |w| {
            w.constructed(tag::STRUCTURE, |s| {
                s.boolean(tag::BOOLEAN, true).int(tag::INTEGER, 8);
            })
            .int(tag::INTEGER, 9);
        });
        let parsed = parse_frame(&frame).unwrap();
        let message = parse_apdu(0, parsed.apdu, "ds", &template).unwrap().unwrap();
        assert_eq!(
            message.data_set_values,
            vec![MmsValue::Structure(vec![MmsValue::Boolean(true)]), MmsValue::new_i32(9)]
        );
    }

    #[test]
    fn test_truncated_apdu() {
        let frame = goose_frame("ds", 1, 0, false, standard_data);
        let parsed = parse_frame(&frame).unwrap();
        let truncated = &parsed.apdu[..parsed.apdu.len() - 2];
        assert!(matches!(parse_apdu(0, truncated, "ds", &template()), Err(GooseError::Ber { .. })));
    }
}
