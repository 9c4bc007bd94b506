//! Model types for hfp-route-core

mod device_address;
mod route_state;

pub use device_address::DeviceAddress;
pub use route_state::{
    RouteCategory, RouteChange, RouteState, AUDIO_OFF_STATE_NAME, CONNECTED_STATE_NAME_PREFIX,
    CONNECTING_STATE_NAME_PREFIX,
};
