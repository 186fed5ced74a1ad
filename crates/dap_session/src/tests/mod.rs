mod session_flows;
