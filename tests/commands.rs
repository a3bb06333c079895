use ipmi_console::commands::{
    ActivatePayload, CloseSession, Command, DeactivatePayload, GetChannelPayloadVersion,
    GetPayloadActivationStatus, SetSessionPrivilegeLevel,
};
use ipmi_console::{Error, PrivilegeLevel, RawResponse};

#[test]
fn activate_payload_parses_response() {
    let response = RawResponse {
        completion_code: 0x00,
        data: vec![
            0x00, 0x00, 0x00, 0x00, // auxiliary data
            0xF8, 0x00, // inbound payload size
            0xC8, 0x00, // outbound payload size
            0x6F, 0x02, // port 623
            0xFF, 0xFF, // VLAN
        ],
    };

    let parsed = ActivatePayload::new(1, true, true)
        .parse_response(response)
        .expect("parse");
    assert_eq!(parsed.inbound_payload_size, 0xF8);
    assert_eq!(parsed.outbound_payload_size, 0xC8);
    assert_eq!(parsed.port, 623);
}

#[test]
fn activate_payload_reports_already_active() {
    let response = RawResponse {
        completion_code: 0x80,
        data: Vec::new(),
    };

    let err = ActivatePayload::new(1, false, false)
        .parse_response(response)
        .expect_err("expected error");
    assert!(matches!(
        err,
        Error::CompletionCode {
            completion_code: 0x80
        }
    ));
}

#[test]
fn payload_activation_status_parses_instances() {
    let response = RawResponse {
        completion_code: 0x00,
        data: vec![0x02, 0x01, 0x00],
    };

    let status = GetPayloadActivationStatus
        .parse_response(response)
        .expect("parse");
    assert_eq!(status.instance_capacity, 2);
    assert!(status.is_active(1));
    assert_eq!(status.first_free_instance(), Some(2));
    assert_eq!(GetPayloadActivationStatus.request_data(), vec![0x01]);
}

#[test]
fn set_session_privilege_encodes_request_data() {
    let cmd = SetSessionPrivilegeLevel {
        privilege: PrivilegeLevel::Administrator,
    };
    assert_eq!(cmd.request_data(), vec![0x04]);

    let level = cmd
        .parse_response(RawResponse {
            completion_code: 0x00,
            data: vec![0x04],
        })
        .expect("parse");
    assert_eq!(level, 0x04);
}

#[test]
fn deactivate_and_close_encode_request_data() {
    assert_eq!(
        DeactivatePayload { instance: 3 }.request_data(),
        vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(
        CloseSession {
            session_id: 0x1234_5678
        }
        .request_data(),
        vec![0x78, 0x56, 0x34, 0x12]
    );
    assert_eq!(GetChannelPayloadVersion.request_data(), vec![0x01]);
}

#[test]
fn close_session_reports_completion_code() {
    let err = CloseSession { session_id: 1 }
        .parse_response(RawResponse {
            completion_code: 0x87,
            data: Vec::new(),
        })
        .expect_err("expected error");
    assert!(matches!(
        err,
        Error::CompletionCode {
            completion_code: 0x87
        }
    ));
}
