pub const TOPIC_CONTROLLER_STATE: &str = "prayer-relay/controller/state";
pub const TOPIC_CONTROLLER_AVAILABILITY: &str = "prayer-relay/controller/availability";

pub const TOPIC_CMD_BUTTON: &str = "prayer-relay/cmnd/button";
pub const TOPIC_CMD_REFRESH: &str = "prayer-relay/cmnd/refresh";
