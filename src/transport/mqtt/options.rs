//! Pure conversion from session settings to rumqttc options

use crate::config::BrokerAddress;
use crate::protocol::QoS;
use crate::transport::ConnectOptions;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};

/// Build rumqttc options for one connection attempt
pub fn build_mqtt_options(
    address: &BrokerAddress,
    client_id: &str,
    options: &ConnectOptions,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, address.host.as_str(), address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_max_packet_size(options.max_packet_size, options.max_packet_size);

    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username.as_str(), password.as_str());
    }

    mqtt_options
}

pub fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}
