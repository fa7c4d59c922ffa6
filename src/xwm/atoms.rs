//! Atoms interned at window manager startup

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        WM_S0,
        WM_PROTOCOLS,
        WM_STATE,
        WM_DELETE_WINDOW,
        WM_TAKE_FOCUS,
        WM_CLIENT_LEADER,
        WL_SURFACE_ID,
        UTF8_STRING,
        _MOTIF_WM_HINTS,
        _NET_FRAME_EXTENTS,
        _NET_STARTUP_ID,
        _NET_SUPPORTING_WM_CHECK,
        _NET_WM_NAME,
        _NET_WM_MOVERESIZE,
        _NET_WM_STATE,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_STATE_MAXIMIZED_VERT,
        _NET_WM_STATE_MAXIMIZED_HORZ,
        CLIPBOARD,
        CLIPBOARD_MANAGER,
        TARGETS,
        TIMESTAMP,
        TEXT,
        INCR,
        _WL_SELECTION,
    }
}

impl Atoms {
    /// Distinct atom values for exercising the window manager without a server
    #[cfg(test)]
    pub fn sequential() -> Self {
        Self {
            WM_S0: 1001,
            WM_PROTOCOLS: 1002,
            WM_STATE: 1003,
            WM_DELETE_WINDOW: 1004,
            WM_TAKE_FOCUS: 1005,
            WM_CLIENT_LEADER: 1006,
            WL_SURFACE_ID: 1007,
            UTF8_STRING: 1008,
            _MOTIF_WM_HINTS: 1009,
            _NET_FRAME_EXTENTS: 1010,
            _NET_STARTUP_ID: 1011,
            _NET_SUPPORTING_WM_CHECK: 1012,
            _NET_WM_NAME: 1013,
            _NET_WM_MOVERESIZE: 1014,
            _NET_WM_STATE: 1015,
            _NET_WM_STATE_FULLSCREEN: 1016,
            _NET_WM_STATE_MAXIMIZED_VERT: 1017,
            _NET_WM_STATE_MAXIMIZED_HORZ: 1018,
            CLIPBOARD: 1019,
            CLIPBOARD_MANAGER: 1020,
            TARGETS: 1021,
            TIMESTAMP: 1022,
            TEXT: 1023,
            INCR: 1024,
            _WL_SELECTION: 1025,
        }
    }
}
