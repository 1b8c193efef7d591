//! Roman WFI data models shipped with the crate.

use super::SchemaPlugin;

inventory::submit! {
    SchemaPlugin::new("wfi_image", r#"{
        "name": "wfi_image",
        "title": "calibrated image",
        "root": {
            "kind": "group",
            "tag": "wfi_image",
            "required": ["data", "dq", "err", "meta"],
            "properties": {
                "data": {"kind": "array", "dtype": "float32", "ndim": 2, "unit": "DN / s"},
                "dq": {"kind": "array", "dtype": "uint32", "ndim": 2},
                "err": {"kind": "array", "dtype": "float32", "ndim": 2},
                "meta": {
                    "kind": "group",
                    "required": ["exposure", "instrument"],
                    "properties": {
                        "exposure": {
                            "kind": "group",
                            "required": ["start_time"],
                            "properties": {
                                "start_time": {"kind": "time"},
                                "end_time": {"kind": "time"}
                            }
                        },
                        "instrument": {
                            "kind": "group",
                            "required": ["detector"],
                            "properties": {
                                "detector": {"kind": "string"},
                                "optical_element": {"kind": "string"}
                            }
                        },
                        "aperture": {
                            "kind": "group",
                            "properties": {
                                "name": {"kind": "string"},
                                "position_angle": {"kind": "number"}
                            }
                        }
                    }
                }
            }
        }
    }"#)
}

inventory::submit! {
    SchemaPlugin::new("wfi_science_raw", r#"{
        "name": "wfi_science_raw",
        "title": "raw science",
        "root": {
            "kind": "group",
            "tag": "wfi_science_raw",
            "required": ["data", "meta"],
            "properties": {
                "data": {"kind": "array", "dtype": "uint16", "ndim": 3, "unit": "DN"},
                "amp33": {"kind": "array", "dtype": "uint16", "ndim": 3},
                "meta": {
                    "kind": "group",
                    "required": ["exposure", "instrument"],
                    "properties": {
                        "exposure": {
                            "kind": "group",
                            "required": ["start_time"],
                            "properties": {
                                "start_time": {"kind": "time"},
                                "ngroups": {"kind": "number"}
                            }
                        },
                        "instrument": {
                            "kind": "group",
                            "required": ["detector"]
                        }
                    }
                }
            }
        }
    }"#)
}
